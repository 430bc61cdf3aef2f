//! Room membership and identity assignment for the relay
//!
//! This module owns the lifetime of every room and member on the server:
//! - Player id assignment from a registry-wide counter
//! - Colour slot assignment by join order
//! - Membership sync on join and leave
//! - Display identity updates and last-known state storage
//!
//! The registry itself is synchronous. It is shared between connection
//! handlers and the broadcast scheduler behind a single lock, so every
//! mutation is atomic with respect to a broadcast snapshot.

use log::{debug, info};
use relay_shared::{encode, Identity, ServerMessage, DEFAULT_PLAYER_NAME, MAX_PLAYER_NAME_LEN};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

pub type SharedRegistry = Arc<RwLock<RoomRegistry>>;

/// Frames a connection may have waiting before new ones are dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Outbound side of one client connection
///
/// Sends are queued on a bounded channel drained by the connection's writer
/// task, so they never block the caller. A peer that stops reading fills
/// its queue and further frames are dropped. Once the writer stops the
/// channel closes and the handle reports itself as no longer open.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Creates a handle together with the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self::new(sender), receiver)
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queues a frame. Delivery failures surface through the connection's
    /// own close path, not here.
    pub fn send(&self, message: Message) {
        if let Err(TrySendError::Full(_)) = self.sender.try_send(message) {
            debug!("Outbound queue full, dropping frame");
        }
    }

    pub fn send_server_message(&self, message: &ServerMessage) {
        if let Some(frame) = frame_for(message) {
            self.send(frame);
        }
    }
}

fn frame_for(message: &ServerMessage) -> Option<Message> {
    match encode(message) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            log::error!("Failed to encode server message: {}", e);
            None
        }
    }
}

/// A connected player inside a room
#[derive(Debug, Clone)]
pub struct Member {
    /// Server-assigned id, unique for the registry's lifetime
    pub player_id: String,
    pub connection: ConnectionHandle,
    /// Room member count at the moment this player joined
    pub color_index: usize,
    pub player_name: String,
    pub avatar_url: Option<String>,
    /// Last relayed state, stored verbatim
    pub last_state: Option<Value>,
}

impl Member {
    fn joined_message(&self) -> ServerMessage {
        ServerMessage::PlayerJoined {
            player_id: self.player_id.clone(),
            color_index: self.color_index,
            player_name: Some(self.player_name.clone()),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Members of one room, kept in join order
#[derive(Debug, Default)]
pub struct Room {
    members: BTreeMap<u64, Member>,
}

impl Room {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, player_id: &str) -> Option<&Member> {
        parse_player_id(player_id).and_then(|key| self.members.get(&key))
    }

    /// Returns the last state of every member that has sent one.
    pub fn snapshot_states(&self) -> BTreeMap<String, Value> {
        self.members
            .values()
            .filter_map(|member| {
                member
                    .last_state
                    .as_ref()
                    .map(|state| (member.player_id.clone(), state.clone()))
            })
            .collect()
    }

    fn broadcast(&self, message: &ServerMessage) {
        if let Some(frame) = frame_for(message) {
            for member in self.members.values() {
                member.connection.send(frame.clone());
            }
        }
    }
}

fn parse_player_id(player_id: &str) -> Option<u64> {
    player_id.parse().ok()
}

/// Strips everything outside printable ASCII, trims, and truncates to
/// `MAX_PLAYER_NAME_LEN` characters. Empty results fall back to the default
/// name.
pub fn sanitize_name(name: &str) -> String {
    let printable: String = name.chars().filter(|c| matches!(c, ' '..='~')).collect();
    let sanitized: String = printable.trim().chars().take(MAX_PLAYER_NAME_LEN).collect();
    if sanitized.is_empty() {
        DEFAULT_PLAYER_NAME.to_string()
    } else {
        sanitized
    }
}

/// Owns every room and member on the server
///
/// Constructed once per server and handed to the accept path and the
/// broadcast scheduler. Rooms are created on first join and evicted when
/// their last member leaves.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    next_player_id: u64,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Creates an empty registry. Player ids start from 1.
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            next_player_id: 1,
        }
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Adds a connection to a room, creating the room if needed
    ///
    /// The new member receives `welcome` first, then one `playerJoined` per
    /// existing peer. Every existing peer receives one `playerJoined` for the
    /// new member.
    pub fn join(&mut self, room_id: &str, connection: ConnectionHandle) -> Member {
        let key = self.next_player_id;
        self.next_player_id += 1;
        let player_id = key.to_string();

        let room = self.rooms.entry(room_id.to_string()).or_default();
        let member = Member {
            player_id: player_id.clone(),
            connection,
            color_index: room.len(),
            player_name: format!("{} {}", DEFAULT_PLAYER_NAME, player_id),
            avatar_url: None,
            last_state: None,
        };

        member.connection.send_server_message(&ServerMessage::Welcome {
            player_id: player_id.clone(),
            room_id: room_id.to_string(),
            color_index: member.color_index,
        });

        let announcement = member.joined_message();
        for peer in room.members.values() {
            peer.connection.send_server_message(&announcement);
            member.connection.send_server_message(&peer.joined_message());
        }

        room.members.insert(key, member.clone());
        info!(
            "[connect] player={} room={} roomSize={}",
            player_id,
            room_id,
            room.len()
        );

        member
    }

    /// Removes a member and tells the rest of the room
    ///
    /// Evicts the room once it is empty. Returns false if the room or member
    /// was already gone.
    pub fn leave(&mut self, room_id: &str, player_id: &str) -> bool {
        let Some(key) = parse_player_id(player_id) else {
            return false;
        };
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.members.remove(&key).is_none() {
            return false;
        }

        info!("[disconnect] player={} room={}", player_id, room_id);
        room.broadcast(&ServerMessage::PlayerLeft {
            player_id: player_id.to_string(),
        });

        if room.is_empty() {
            self.rooms.remove(room_id);
        }
        true
    }

    /// Updates a member's display identity and announces it to the whole
    /// room, the updater included.
    pub fn set_identity(&mut self, room_id: &str, player_id: &str, identity: Identity) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(member) = parse_player_id(player_id).and_then(|key| room.members.get_mut(&key))
        else {
            return false;
        };

        member.player_name = identity.player_name;
        member.avatar_url = identity.avatar_url;
        let message = ServerMessage::PlayerIdentity {
            player_id: member.player_id.clone(),
            player_name: member.player_name.clone(),
            avatar_url: member.avatar_url.clone(),
        };
        room.broadcast(&message);
        true
    }

    /// Overwrites a member's last state. A `null` state clears it.
    pub fn record_state(&mut self, room_id: &str, player_id: &str, state: Value) -> bool {
        let member = self
            .rooms
            .get_mut(room_id)
            .zip(parse_player_id(player_id))
            .and_then(|(room, key)| room.members.get_mut(&key));

        match member {
            Some(member) => {
                member.last_state = (!state.is_null()).then_some(state);
                true
            }
            None => false,
        }
    }

    /// Last states of a room's members, omitting members with none.
    pub fn snapshot_states(&self, room_id: &str) -> BTreeMap<String, Value> {
        self.rooms
            .get(room_id)
            .map(Room::snapshot_states)
            .unwrap_or_default()
    }

    pub fn rooms(&self) -> impl Iterator<Item = (&str, &Room)> {
        self.rooms.iter().map(|(id, room)| (id.as_str(), room))
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.rooms.values().map(Room::len).sum()
    }
}

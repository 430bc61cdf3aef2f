//! Per-connection handling: upgrade, join, inbound message pump, leave.

use crate::error::RelayError;
use crate::registry::{sanitize_name, ConnectionHandle, RoomRegistry, SharedRegistry};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use relay_shared::{decode, room_from_query, ClientMessage, Identity, DEFAULT_ROOM};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Server-side view of one connected player
#[derive(Debug, Clone)]
pub struct Session {
    pub room_id: String,
    pub player_id: String,
    pub color_index: usize,
    pub addr: SocketAddr,
}

impl Session {
    /// Applies one inbound text frame to the registry.
    ///
    /// Returns false when the frame was dropped: malformed JSON, an unknown
    /// message type, or a player that is no longer tracked.
    pub fn apply(&self, registry: &mut RoomRegistry, text: &str) -> bool {
        let message: ClientMessage<Value> = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    "Dropping malformed message from player {}: {}",
                    self.player_id, e
                );
                return false;
            }
        };

        match message {
            ClientMessage::Identify {
                player_name,
                avatar_url,
            } => {
                let identity = Identity::new(
                    sanitize_name(player_name.as_deref().unwrap_or_default()),
                    avatar_url.filter(|url| !url.is_empty()),
                );
                registry.set_identity(&self.room_id, &self.player_id, identity)
            }
            ClientMessage::State { payload } => {
                registry.record_state(&self.room_id, &self.player_id, payload)
            }
        }
    }

    pub async fn handle_text(&self, registry: &SharedRegistry, text: &str) -> bool {
        let mut registry = registry.write().await;
        self.apply(&mut registry, text)
    }
}

/// Runs one client connection from upgrade to leave
///
/// The room comes from the `room` query parameter of the upgrade request.
/// Outbound frames go through a dedicated writer task so registry sends
/// never wait on the socket. Any way the read side ends (close frame,
/// stream error, end of stream) goes through the same leave path.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: SharedRegistry,
) -> Result<(), RelayError> {
    let mut room_id = DEFAULT_ROOM.to_string();
    let ws_stream = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            room_id = room_from_query(request.uri().query());
            Ok(response)
        },
    )
    .await?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (connection, mut outbound) = ConnectionHandle::channel();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = ws_sender.send(frame).await {
                debug!("Write to {} failed: {}", addr, e);
                return;
            }
        }
        let _ = ws_sender.close().await;
    });

    let session = {
        let member = registry.write().await.join(&room_id, connection);
        Session {
            room_id,
            player_id: member.player_id,
            color_index: member.color_index,
            addr,
        }
    };
    debug!(
        "Player {} in room {} (colour slot {}) connected from {}",
        session.player_id, session.room_id, session.color_index, session.addr
    );

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                session.handle_text(&registry, text.as_str()).await;
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    session.handle_text(&registry, text).await;
                }
                Err(_) => debug!("Dropping non-UTF-8 frame from player {}", session.player_id),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Connection error for player {}: {}", session.player_id, e);
                break;
            }
        }
    }

    registry
        .write()
        .await
        .leave(&session.room_id, &session.player_id);
    debug!(
        "Player {} from {} left room {}",
        session.player_id, session.addr, session.room_id
    );

    // The registry held the last handle, so the writer drains and exits.
    if let Err(e) = writer.await {
        warn!("Writer task for {} failed: {}", addr, e);
    }
    Ok(())
}

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const BROADCAST_RATE_HZ: u32 = 10;
pub const NETWORK_SEND_RATE_HZ: u32 = 10;
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_ROOM: &str = "default";
pub const DEFAULT_PLAYER_NAME: &str = "Player";
pub const MAX_PLAYER_NAME_LEN: usize = 20;

pub const LOCAL_PLAYER_COLOR: u32 = 0x00ccff;
pub const REMOTE_PLAYER_COLORS: [u32; 6] = [0xff6600, 0x66ff00, 0xff0066, 0xffcc00, 0x9900ff, 0x00ffcc];

/// Maps a colour slot onto the remote palette.
///
/// Slots are handed out by join order and are not bounded by the palette
/// size, so they wrap.
pub fn palette_color(color_index: usize) -> u32 {
    REMOTE_PLAYER_COLORS[color_index % REMOTE_PLAYER_COLORS.len()]
}

/// Timer period for a fixed rate in Hz. A zero rate is treated as 1 Hz.
pub fn period_for_rate(rate_hz: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(rate_hz.max(1)))
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Left,
    #[default]
    Right,
}

/// Movement state produced by a client's local simulation.
///
/// The relay never interprets it; only clients decode it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub vx: f64,
    #[serde(default)]
    pub vy: f64,
    #[serde(default)]
    pub facing: Facing,
}

impl StateSnapshot {
    pub fn new(x: f64, y: f64, vx: f64, vy: f64, facing: Facing) -> Self {
        Self {
            x,
            y,
            vx,
            vy,
            facing,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub player_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(player_name: impl Into<String>, avatar_url: Option<String>) -> Self {
        Self {
            player_name: player_name.into(),
            avatar_url,
        }
    }
}

/// Messages sent from a client to the relay.
///
/// The relay decodes `ClientMessage<serde_json::Value>` so the state payload
/// stays opaque to it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage<S = StateSnapshot> {
    #[serde(rename_all = "camelCase")]
    Identify {
        #[serde(default, deserialize_with = "lenient_text")]
        player_name: Option<String>,
        #[serde(default, deserialize_with = "lenient_text")]
        avatar_url: Option<String>,
    },
    State {
        #[serde(default)]
        payload: S,
    },
}

/// Reads an identify field as text. Numbers and booleans are stringified;
/// null, objects and arrays read as absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(text)) => Some(text),
        Some(serde_json::Value::Number(number)) => Some(number.to_string()),
        Some(serde_json::Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

impl ClientMessage {
    pub fn identify(identity: &Identity) -> Self {
        ClientMessage::Identify {
            player_name: Some(identity.player_name.clone()),
            avatar_url: identity.avatar_url.clone(),
        }
    }
}

/// Messages sent from the relay to its clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage<S = serde_json::Value> {
    #[serde(rename_all = "camelCase")]
    Welcome {
        player_id: String,
        room_id: String,
        color_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_id: String,
        color_index: usize,
        #[serde(default)]
        player_name: Option<String>,
        #[serde(default)]
        avatar_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft { player_id: String },
    #[serde(rename_all = "camelCase")]
    PlayerIdentity {
        player_id: String,
        player_name: String,
        #[serde(default)]
        avatar_url: Option<String>,
    },
    StateUpdate { states: BTreeMap<String, S> },
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(text)
}

/// Reads the `room` parameter out of an upgrade request's query string.
pub fn room_from_query(query: Option<&str>) -> String {
    query
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "room")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|room| !room.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOM.to_string())
}

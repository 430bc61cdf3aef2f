//! # Room Relay Client Library
//!
//! Client half of the multiplayer position sync. The game simulates its own
//! player locally and hands the latest state to a `NetworkClient`, which
//! uploads it at a fixed rate. Everything the relay sends back is turned
//! into typed `NetworkEvent`s for remote player proxies and the HUD.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Connection lifecycle, the send timer and inbound demultiplexing:
//! - Room selection through the upgrade URL
//! - One-shot identity announcement on open
//! - Self-exclusion from state batches
//! - Offline fallback when no connection can be made
//!
//! ### Events Module (`events`)
//! The event enum and a small observer registry keyed by event kind.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_client::{EventBus, EventKind, NetworkClient, NetworkEvent};
//! use relay_shared::{Facing, Identity, StateSnapshot};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let events = Arc::new(EventBus::new());
//!     events.on(EventKind::StateBatch, |event| {
//!         if let NetworkEvent::StateBatch(states) = event {
//!             println!("{} remote players", states.len());
//!         }
//!     });
//!
//!     let mut client = NetworkClient::new("ws://127.0.0.1:3001", Arc::clone(&events));
//!     client.connect("lobby", Some(Identity::new("Hero", None)));
//!
//!     // Called from the game loop whenever the local player moves
//!     client.update_local_state(StateSnapshot::new(120.0, 380.0, 300.0, 0.0, Facing::Right));
//!
//!     client.disconnect().await;
//! }
//! ```

pub mod events;
pub mod network;

pub use events::{EventBus, EventKind, ListenerId, NetworkEvent};
pub use network::{ConnectionState, NetworkClient};

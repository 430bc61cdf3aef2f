//! # Room Relay Server Library
//!
//! This library provides the relay half of the multiplayer position sync.
//! Every client simulates its own player locally; the relay only tells each
//! room who is in it and forwards everyone's latest movement state to
//! everyone else.
//!
//! ## Core Responsibilities
//!
//! ### Room Membership
//! Rooms are created on first join and evicted when their last member
//! leaves. Each joiner gets a player id from a registry-wide counter and a
//! colour slot equal to the room's size at join time. Joining performs a full
//! membership sync in both directions.
//!
//! ### Identity
//! Clients announce a display name and avatar with `identify`. Names are
//! sanitised (printable ASCII, trimmed, at most 20 characters) and the update
//! is announced to the whole room.
//!
//! ### State Broadcasting
//! Uploaded states are stored verbatim and fanned out by a single fixed-rate
//! scheduler, decoupled from how often clients upload.
//!
//! ## Non-authoritative by Design
//! The relay never validates or reconciles movement. Malformed messages are
//! dropped without closing the connection, and messages about players that
//! have already left are no-ops.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Rooms, members, colour slots, identity and last-state storage.
//!
//! ### Session Module (`session`)
//! Per-connection upgrade, inbound message pump and leave-on-close.
//!
//! ### Broadcast Module (`broadcast`)
//! The fixed-rate `stateUpdate` scheduler.
//!
//! ### Network Module (`network`)
//! Listener, accept loop and task wiring.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_server::network::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the relay and broadcast room states at 10Hz
//!     let server = RelayServer::bind("0.0.0.0:3001", 10).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod error;
pub mod network;
pub mod registry;
pub mod session;

pub use error::RelayError;
pub use network::RelayServer;
pub use registry::{ConnectionHandle, Member, RoomRegistry, SharedRegistry};

//! Error types for the relay server.

use tokio_tungstenite::tungstenite;

/// Failures that end a server task or a single connection.
///
/// Per-message problems (bad JSON, unknown message types, stale player
/// references) never become errors; they are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Binding or accepting on the listener failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket handshake or stream failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

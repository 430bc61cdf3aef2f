//! Server network layer: WebSocket accept loop and broadcast coordination

use crate::broadcast::BroadcastScheduler;
use crate::error::RelayError;
use crate::registry::{RoomRegistry, SharedRegistry};
use crate::session::handle_connection;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Relay server owning the listener, the room registry and the broadcast rate
pub struct RelayServer {
    listener: TcpListener,
    registry: SharedRegistry,
    broadcast_rate_hz: u32,
}

impl RelayServer {
    pub async fn bind(addr: &str, broadcast_rate_hz: u32) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);

        Ok(RelayServer {
            listener,
            registry: RoomRegistry::shared(),
            broadcast_rate_hz,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Spawns task that broadcasts member states at the configured rate
    fn spawn_broadcaster(&self) {
        let scheduler = BroadcastScheduler::new(self.registry(), self.broadcast_rate_hz);
        info!(
            "Broadcasting room states every {}ms",
            scheduler.period().as_millis()
        );
        tokio::spawn(scheduler.run());
    }

    /// Main server loop: one task per accepted connection
    pub async fn run(self) -> Result<(), RelayError> {
        self.spawn_broadcaster();

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted TCP connection from {}", addr);
                    let registry = self.registry();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, registry).await {
                            debug!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = assert_ok!(RelayServer::bind("127.0.0.1:0", 10).await);
        let addr = assert_ok!(server.local_addr());

        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.registry().read().await.room_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let result = RelayServer::bind("not-an-address", 10).await;
        assert!(matches!(result, Err(RelayError::Io(_))));
    }
}

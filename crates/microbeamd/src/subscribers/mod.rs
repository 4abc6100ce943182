//! TCP pub/sub server for scan lifecycle events.
//!
//! Subscribers connect and receive one line per event:
//! `start_run <id>`, `pos <x> <y>`, `stop_run`, `abort`. The first
//! connection is the primary subscriber; with ack-gating enabled it answers
//! each position with a single `ack` line.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  register   ┌──────────────────┐
//! │ SubscriberServer │────────────▶│  SubscriberHub   │
//! │  (TcpListener)   │             │ writers, readers │
//! └──────────────────┘             └────────┬─────────┘
//!                                           │ broadcast / read_ack
//!                                           ▼
//!                                  ┌──────────────────┐
//!                                  │  RunController   │
//!                                  │   + scan task    │
//!                                  └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop continues

mod hub;

pub use hub::{SubscriberHub, WRITE_TIMEOUT};

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ServerError;

/// Accepts subscriber connections into a [`SubscriberHub`].
pub struct SubscriberServer {
    listener: TcpListener,
    hub: SubscriberHub,
    cancel_token: CancellationToken,
}

impl SubscriberServer {
    /// Binds the listening socket.
    pub async fn bind(
        addr: &str,
        hub: SubscriberHub,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                error: e.to_string(),
            })?;
        Ok(Self {
            listener,
            hub,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = ?self.listener.local_addr().ok(), "Subscriber server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Subscriber server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.hub.register(stream, peer);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept subscriber");
                        }
                    }
                }
            }
        }

        self.hub.clear().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microbeam_protocol::SubscriberMessage;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_server_registers_connections() {
        let hub = SubscriberHub::new();
        let cancel = CancellationToken::new();
        let server = SubscriberServer::bind("127.0.0.1:0", hub.clone(), cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if hub.has_primary() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(hub.has_primary());

        hub.broadcast(&SubscriberMessage::Abort).await;
        let mut lines = BufReader::new(client).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "abort");

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let result =
            SubscriberServer::bind(&addr, SubscriberHub::new(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}

//! TCP control surface.
//!
//! Front-ends send one JSON request per line (`write_dac`, `start_run`,
//! `stop_run`, `poll`, `status`) and receive one JSON response per line.
//! Every accepted connection gets its own [`ControlConnection`] task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ControlConnection, MAX_MESSAGE_SIZE};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::ControllerHandle;
use crate::error::ServerError;

/// Accepts control clients and serves them against the run controller.
pub struct ControlServer {
    listener: TcpListener,
    controller: ControllerHandle,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl ControlServer {
    /// Binds the listening socket.
    pub async fn bind(
        addr: &str,
        controller: ControllerHandle,
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
            controller,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = ?self.listener.local_addr().ok(), "Control server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Control server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let number = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            debug!(connection = number, %peer, "Accepted control client");
                            let (reader, writer) = stream.into_split();
                            let connection = ControlConnection::new(
                                reader,
                                writer,
                                self.controller.clone(),
                                peer,
                            );
                            tokio::spawn(connection.run());
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

//! One control client connection.
//!
//! Reads JSON requests line by line, forwards them to the run controller
//! and writes one JSON response per request. Bad requests are answered
//! with an error response and the connection stays open. Each connection
//! keeps its own poll cursor, so two front-ends polling the same run both
//! see every hit once.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::time::Duration;

use microbeam_core::PollCursor;
use microbeam_protocol::{ControlRequest, ControlResponse};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::controller::ControllerHandle;

/// Maximum request size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single control client.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    controller: ControllerHandle,
    cursor: PollCursor,
    peer: SocketAddr,
}

impl ControlConnection {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        controller: ControllerHandle,
        peer: SocketAddr,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            controller,
            cursor: PollCursor::new(),
            peer,
        }
    }

    /// Serves requests until the client disconnects.
    pub async fn run(mut self) {
        debug!(peer = %self.peer, "Control client connected");

        if let Err(e) = self.process_requests().await {
            debug!(peer = %self.peer, error = %e, "Control connection closed");
        }

        debug!(peer = %self.peer, "Control client disconnected");
    }

    async fn process_requests(&mut self) -> Result<(), ConnectionError> {
        loop {
            let line = match timeout(READ_TIMEOUT, self.read_line()).await {
                Ok(Ok(line)) => line,
                Ok(Err(ConnectionError::Eof)) => return Ok(()),
                Ok(Err(ConnectionError::MessageTooLarge { size, max })) => {
                    warn!(peer = %self.peer, size, max, "Oversized control request");
                    let response = ControlResponse::error(format!(
                        "Message too large: {size} bytes (max: {max})"
                    ));
                    self.send(&response).await?;
                    return Err(ConnectionError::MessageTooLarge { size, max });
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::Timeout),
            };

            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Malformed control request");
                    ControlResponse::error(format!("Invalid request: {e}"))
                }
            };
            self.send(&response).await?;
        }
    }

    async fn handle_request(&mut self, request: ControlRequest) -> ControlResponse {
        let result = match request {
            ControlRequest::WriteDac {
                dac_x,
                dac_y,
                units,
            } => self
                .controller
                .write_dac(dac_x, dac_y, units)
                .await
                .map(|_| ControlResponse::Ok),
            ControlRequest::StartRun(params) => {
                info!(peer = %self.peer, "Run start requested");
                self.controller
                    .start_run(params)
                    .await
                    .map(|_| ControlResponse::Ok)
            }
            ControlRequest::StopRun => {
                info!(peer = %self.peer, "Run stop requested");
                self.controller
                    .stop_run()
                    .await
                    .map(|()| ControlResponse::Ok)
            }
            ControlRequest::Poll => self
                .controller
                .poll(&mut self.cursor)
                .await
                .map(ControlResponse::Poll),
            ControlRequest::Status => self
                .controller
                .status()
                .await
                .map(ControlResponse::Status),
        };

        result.unwrap_or_else(|e| ControlResponse::error(e.to_string()))
    }

    /// Reads one line, refusing lines longer than [`MAX_MESSAGE_SIZE`].
    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut line = String::new();
        let limit = MAX_MESSAGE_SIZE as u64 + 1;
        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(line)
    }

    async fn send(&mut self, response: &ControlResponse) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(response).map_err(|e| ConnectionError::Io(e.to_string()))?;

        let write = async {
            self.writer.write_all(json.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        };
        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Errors that end a control connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

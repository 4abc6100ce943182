//! Microbeam Protocol - Wire formats of the daemon's sockets
//!
//! Two protocols are defined here:
//!
//! - the subscriber stream, plain `\n`-terminated text lines broadcast to
//!   every listener (`start_run 3`, `pos -100 0`, `stop_run`, `abort`) with
//!   a single `ack` line as the only upstream message;
//! - the control surface, JSON lines tagged by `action` (requests) and
//!   `type` (responses).

pub mod control;
pub mod error;
pub mod subscriber;

pub use control::{ControlRequest, ControlResponse, PollReport};
pub use error::ProtocolError;
pub use subscriber::{is_ack, SubscriberMessage, ACK};

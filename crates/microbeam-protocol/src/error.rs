use thiserror::Error;

/// Errors decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown subscriber message: {0}")]
    UnknownMessage(String),

    #[error("Malformed {kind} message: {line}")]
    Malformed { kind: &'static str, line: String },
}

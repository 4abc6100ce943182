//! Hardware error types.

use std::io;

use thiserror::Error;

/// pigpio error code for an unknown or deleted script.
pub const PI_BAD_SCRIPT_ID: i32 = -48;

/// Errors raised by trigger backends.
#[derive(Error, Debug)]
pub enum HardwareError {
    /// The pigpio daemon could not be reached
    #[error("Failed to connect to pigpio daemon at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The daemon answered a command with a negative status
    #[error("pigpio {command} failed with code {code}")]
    Pigpio { command: &'static str, code: i32 },

    /// `arm_and_wait` called before `prepare`
    #[error("No edge program prepared")]
    NotPrepared,

    #[error("Edge program {id} failed")]
    ProgramFailed { id: u32 },

    #[error("Edge program {id} did not finish initialising")]
    ProgramInitTimeout { id: u32 },

    /// Jump to a tag the program does not define
    #[error("Edge program jumps to undefined tag {0}")]
    UndefinedTag(u32),

    #[error("Malformed pigpio response: {0}")]
    MalformedResponse(String),
}

impl HardwareError {
    /// True when pigpio reported the script as unknown.
    pub fn is_bad_script(&self) -> bool {
        matches!(self, Self::Pigpio { code, .. } if *code == PI_BAD_SCRIPT_ID)
    }
}

/// Result type for hardware operations.
pub type HardwareResult<T> = Result<T, HardwareError>;

//! Run controller commands and errors.
//!
//! - `ControlCommand`: requests sent to the controller actor
//! - `ControlError`: why a request was refused or failed

use microbeam_core::{DacPoint, DomainError, PollCursor, RunId, RunStatus, ScanParameters, ScanUnit};
use microbeam_protocol::PollReport;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Controller Commands
// ============================================================================

/// Commands sent to the controller actor.
///
/// Each command carries a oneshot channel for the reply.
#[derive(Debug)]
pub enum ControlCommand {
    /// Move the beam outside of a run.
    ///
    /// # Errors
    /// - `ControlError::RunActive` while a scan owns the DAC
    /// - `ControlError::Invalid` for micrometers without calibration
    WriteDac {
        x: f64,
        y: f64,
        unit: ScanUnit,
        respond_to: oneshot::Sender<Result<DacPoint, ControlError>>,
    },

    /// Start a run.
    ///
    /// # Errors
    /// - `ControlError::RunActive` if a run is in progress
    /// - `ControlError::Invalid` for bad parameters or missing calibration
    /// - `ControlError::NoPrimarySubscriber` when ack-gating has nobody to ask
    StartRun {
        /// Boxed to keep the enum small
        params: Box<ScanParameters>,
        respond_to: oneshot::Sender<Result<RunId, ControlError>>,
    },

    /// Abort the active run. Answered once the scan has unwound.
    ///
    /// # Errors
    /// - `ControlError::NotActive` if no run is in progress
    StopRun {
        respond_to: oneshot::Sender<Result<(), ControlError>>,
    },

    /// State snapshot plus the hits after `cursor`.
    Poll {
        cursor: PollCursor,
        respond_to: oneshot::Sender<(PollReport, PollCursor)>,
    },

    Status {
        respond_to: oneshot::Sender<RunStatus>,
    },
}

// ============================================================================
// Controller Errors
// ============================================================================

/// Errors returned by the run controller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("A run is active (system state not IDLE)")]
    RunActive,

    #[error("No run to stop")]
    NotActive,

    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("TCP client required for run control, but none connected")]
    NoPrimarySubscriber,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Run storage error: {0}")]
    Storage(String),

    #[error("Latch-up channel unavailable: {0}")]
    LatchChannel(String),

    #[error("Controller channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(ControlError::NotActive.to_string(), "No run to stop");
        let err: ControlError = DomainError::Uncalibrated.into();
        assert!(err.to_string().contains("calibration"));
        assert!(ControlError::Hardware("spi".to_string())
            .to_string()
            .contains("spi"));
    }
}

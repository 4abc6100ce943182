//! Client interface for the run controller actor.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `ControlError::ChannelClosed`

use microbeam_core::{DacPoint, PollCursor, RunId, RunStatus, ScanParameters, ScanUnit};
use microbeam_protocol::PollReport;
use tokio::sync::{mpsc, oneshot};

use super::commands::{ControlCommand, ControlError};

/// Cheap-to-clone handle to the controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    sender: mpsc::Sender<ControlCommand>,
}

impl ControllerHandle {
    pub fn new(sender: mpsc::Sender<ControlCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| ControlError::ChannelClosed)?;
        rx.await.map_err(|_| ControlError::ChannelClosed)
    }

    /// Moves the beam while idle. Returns the clamped DAC position.
    ///
    /// # Errors
    ///
    /// - `ControlError::RunActive` while a run is in progress
    /// - `ControlError::Invalid` for micrometers without calibration
    /// - `ControlError::Hardware` if the DAC write fails
    pub async fn write_dac(
        &self,
        x: f64,
        y: f64,
        unit: ScanUnit,
    ) -> Result<DacPoint, ControlError> {
        self.request(|respond_to| ControlCommand::WriteDac {
            x,
            y,
            unit,
            respond_to,
        })
        .await?
    }

    /// Starts a run and returns its id.
    ///
    /// # Errors
    ///
    /// - `ControlError::RunActive` if a run is already in progress
    /// - `ControlError::Invalid` for bad parameters
    /// - `ControlError::NoPrimarySubscriber` if ack-gating has no primary
    /// - `ControlError::Storage` if the run files cannot be created
    pub async fn start_run(&self, params: ScanParameters) -> Result<RunId, ControlError> {
        self.request(|respond_to| ControlCommand::StartRun {
            params: Box::new(params),
            respond_to,
        })
        .await?
    }

    /// Stops the active run, returning once the controller is idle again.
    ///
    /// # Errors
    ///
    /// - `ControlError::NotActive` if no run is in progress
    pub async fn stop_run(&self) -> Result<(), ControlError> {
        self.request(|respond_to| ControlCommand::StopRun { respond_to })
            .await?
    }

    /// Returns the state and the hits after `cursor`, advancing it.
    pub async fn poll(&self, cursor: &mut PollCursor) -> Result<PollReport, ControlError> {
        let current = *cursor;
        let (report, next) = self
            .request(|respond_to| ControlCommand::Poll {
                cursor: current,
                respond_to,
            })
            .await?;
        *cursor = next;
        Ok(report)
    }

    pub async fn status(&self) -> Result<RunStatus, ControlError> {
        self.request(|respond_to| ControlCommand::Status { respond_to })
            .await
    }

    /// Whether the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

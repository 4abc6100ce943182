//! Control surface messages (JSON lines).

use microbeam_core::{DacPoint, RunId, RunState, RunStatus, ScanParameters, ScanUnit};
use serde::{Deserialize, Serialize};

/// Requests accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Position the beam while no run is active
    WriteDac {
        dac_x: f64,
        dac_y: f64,
        #[serde(default = "default_units")]
        units: ScanUnit,
    },

    /// Start a raster scan
    StartRun(ScanParameters),

    /// Abort the active scan and wait until it has unwound
    StopRun,

    /// Controller state plus hits not yet seen by this connection
    Poll,

    /// Full counter snapshot
    Status,
}

fn default_units() -> ScanUnit {
    ScanUnit::Lsb
}

/// Responses written back on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Error { message: String },
    Poll(PollReport),
    Status(RunStatus),
}

impl ControlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Payload of a `poll` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollReport {
    pub state: RunState,
    pub run_id: Option<RunId>,
    pub dac_x: i16,
    pub dac_y: i16,
    pub scan_points: u64,
    pub scan_points_done: u64,
    /// Hits observed since this connection's previous poll, in order
    pub new_hits: Vec<DacPoint>,
}

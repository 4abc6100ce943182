//! Run controller using the actor pattern.
//!
//! The controller owns the run state machine (`IDLE` / `RUN_ACTIVE`), the
//! hit accounting and the per-run files. It drives one scan task at a time
//! against the trigger backend and the subscriber hub.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐ ControlCommand ┌───────────────────┐  spawn   ┌────────────┐
//! │ ControllerHandle │───────────────▶│   RunController   │─────────▶│  ScanTask  │
//! └──────────────────┘    (mpsc)      │ state, counters,  │◀─────────│            │
//!                                     │ hit list, files   │ScanEvent └─────┬──────┘
//! ┌──────────────────┐   HitBatch     │                   │                │ deliver / halt
//! │     HitPump      │───────────────▶│                   │                ▼
//! │ (arm/wait loop)  │  (bounded)     └───────────────────┘          ┌────────────┐
//! └────────┬─────────┘◀──────────────────────────────────────────────│ PumpHandle │
//!          │ arm_and_wait                                            └────────────┘
//!          ▼
//! ┌──────────────────┐
//! │  TriggerBackend  │
//! └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use microbeam_core::Calibration;
use microbeam_hw::{spawn_hit_pump, TriggerBackend, HIT_CHANNEL_CAPACITY};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod actor;
mod commands;
mod handle;
mod scan;

pub use actor::{ControllerParts, RunController};
pub use commands::{ControlCommand, ControlError};
pub use handle::ControllerHandle;
pub use scan::{AbortReason, ScanEvent, ScanOutcome};

use crate::latch::LatchSource;
use crate::run_log::RunLogFile;
use crate::storage::RunIdStore;
use crate::subscribers::SubscriberHub;

/// Command channel buffer size
const COMMAND_BUFFER: usize = 100;

/// Run controller settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Holds `run.id`, `cal.json` and the run directories
    pub run_dir: PathBuf,
    pub wait_for_client_ack: bool,
    pub swap_xy_every_second_repetition: bool,
    /// Hits counted per edge program run
    pub hits_per_batch: u32,
    pub latch: Option<LatchSource>,
    /// Pause after a latch-up before the scan continues
    pub latch_recovery: Duration,
    /// Marks run logs of simulated runs
    pub simulated: bool,
}

impl ControllerSettings {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            wait_for_client_ack: false,
            swap_xy_every_second_repetition: true,
            hits_per_batch: 1,
            latch: None,
            latch_recovery: Duration::from_secs(5),
            simulated: false,
        }
    }
}

/// Spawns the hit pump and the controller actor.
///
/// Opens the run id counter and loads the calibration from the run
/// directory first; either failing is a startup error.
///
/// # Errors
///
/// - `ControlError::Storage` if `run.id` cannot be created or parsed
/// - `ControlError::Invalid` if `cal.json` exists but is unusable
pub fn spawn_controller(
    settings: ControllerSettings,
    backend: Arc<dyn TriggerBackend>,
    hub: SubscriberHub,
    run_log: RunLogFile,
    shutdown: CancellationToken,
) -> Result<ControllerHandle, ControlError> {
    let run_ids =
        RunIdStore::open(&settings.run_dir).map_err(|e| ControlError::Storage(e.to_string()))?;
    let calibration = Calibration::load(&settings.run_dir)?;

    let (pump, hits) = spawn_hit_pump(
        Arc::clone(&backend),
        HIT_CHANNEL_CAPACITY,
        shutdown.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let parts = ControllerParts {
        backend,
        pump,
        hits,
        hub,
        run_log,
        run_ids,
        calibration,
    };
    let actor = RunController::new(cmd_rx, parts, settings, shutdown);
    tokio::spawn(actor.run());

    Ok(ControllerHandle::new(cmd_tx))
}

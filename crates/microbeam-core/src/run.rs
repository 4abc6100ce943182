//! Run identity, state and hit records.

use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dac::DacPoint;

// ============================================================================
// Run Identity
// ============================================================================

/// Sequential run number, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(u32);

impl RunId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Identifier following this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Name of the per-run directory, e.g. `run_007`.
    pub fn dir_name(&self) -> String {
        format!("run_{:03}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "RUN_ACTIVE")]
    Active,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Active => "RUN_ACTIVE",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Hits
// ============================================================================

/// One or more hits reported together by the trigger hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct HitBatch {
    /// Hardware tick in microseconds. Wraps roughly every 72 minutes.
    pub hw_timestamp_us: u32,
    pub wall_timestamp: DateTime<Utc>,
    /// Beam position when the batch completed
    pub position: DacPoint,
    pub count: u32,
    /// Number of the latch-up this batch is the first to follow
    pub latch_up: Option<u64>,
}

impl HitBatch {
    /// Wall clock as fractional Unix seconds.
    pub fn wall_seconds(&self) -> f64 {
        self.wall_timestamp.timestamp() as f64
            + f64::from(self.wall_timestamp.timestamp_subsec_nanos()) * 1e-9
    }
}

/// Snapshot of the controller counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub run_id: Option<RunId>,
    pub dac: DacPoint,
    pub scan_points: u64,
    pub scan_points_done: u64,
    pub hit_count: u64,
    pub timeout_counter: u64,
    pub latch_counter: u64,
}

// ============================================================================
// Poll Cursor
// ============================================================================

/// Read position of one poll client in the current run's hit list.
///
/// The cursor remembers which run it was advanced in. When a newer run
/// becomes current it restarts at the beginning of that run's hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollCursor {
    run_id: Option<RunId>,
    index: usize,
}

impl PollCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the range of hits not yet delivered and moves past them.
    ///
    /// `total` is the length of the current run's hit list.
    pub fn advance(&mut self, current_run: Option<RunId>, total: usize) -> Range<usize> {
        if self.run_id != current_run {
            self.run_id = current_run;
            self.index = 0;
        }
        let start = self.index.min(total);
        self.index = total;
        start..total
    }

    pub fn position(&self) -> usize {
        self.index
    }
}

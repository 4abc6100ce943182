//! The trigger backend abstraction.
//!
//! A backend owns the deflection DAC, the shutter output and the trigger
//! input. Hits are counted by an edge program (see [`crate::program`]) that
//! opens the shutter, counts qualifying trigger transitions and closes the
//! shutter again, so edges outside an armed program never reach the count.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use microbeam_core::{DacPoint, HitBatch};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::HardwareResult;

// ============================================================================
// Line Configuration
// ============================================================================

/// Logic level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn value(self) -> u32 {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }

    pub fn inverted(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

/// Trigger transition that counts as a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdge {
    Rising,
    /// The trigger input is inverted on the standard board
    #[default]
    Falling,
}

impl TriggerEdge {
    /// Line level right after a qualifying transition.
    pub fn level_after(self) -> Level {
        match self {
            Self::Rising => Level::High,
            Self::Falling => Level::Low,
        }
    }
}

impl fmt::Display for TriggerEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rising => f.write_str("rising"),
            Self::Falling => f.write_str("falling"),
        }
    }
}

/// Broadcom GPIO numbers of the control lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioLayout {
    /// 5 V TTL trigger input
    pub trigger: u32,
    pub shutter: u32,
    /// DAC load strobe
    pub ldac: u32,
}

impl Default for GpioLayout {
    fn default() -> Self {
        Self {
            trigger: 27,
            shutter: 17,
            ldac: 25,
        }
    }
}

/// Settings shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    pub gpio: GpioLayout,
    pub edge: TriggerEdge,
    pub shutter_open_level: Level,
    /// Poll cadence at which the controller can safely observe hits
    pub min_hit_delay: Duration,
}

impl TriggerConfig {
    pub fn shutter_closed_level(&self) -> Level {
        self.shutter_open_level.inverted()
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            gpio: GpioLayout::default(),
            edge: TriggerEdge::default(),
            shutter_open_level: Level::Low,
            min_hit_delay: Duration::from_millis(1),
        }
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Hardware trigger interface.
///
/// Implementations are shared between the run controller and the hit pump,
/// so every method takes `&self`.
#[async_trait]
pub trait TriggerBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Writes both DAC axes and latches them together.
    async fn set_position(&self, point: DacPoint) -> HardwareResult<()>;

    /// Last position written.
    fn position(&self) -> DacPoint;

    async fn open_shutter(&self) -> HardwareResult<()>;

    async fn close_shutter(&self) -> HardwareResult<()>;

    /// Compiles and installs the edge program for batches of `hits_per_batch`.
    async fn prepare(&self, hits_per_batch: u32) -> HardwareResult<()>;

    /// Runs the installed program once and waits for it to complete.
    ///
    /// When cancelled, the program is stopped and any edges it had already
    /// counted come back as a smaller batch. Returns `Ok(None)` when nothing
    /// was counted or when the program vanished and the caller should simply
    /// arm again.
    async fn arm_and_wait(&self, cancel: &CancellationToken) -> HardwareResult<Option<HitBatch>>;

    /// Stops any running program and closes the shutter.
    async fn disarm(&self) -> HardwareResult<()>;

    /// Releases hardware resources before exit.
    async fn shutdown(&self) -> HardwareResult<()> {
        self.disarm().await
    }

    /// Minimum safe delay between two hit checks.
    fn min_hit_delay(&self) -> Duration;
}

// ============================================================================
// Position Mirror
// ============================================================================

/// Lock-free mirror of the last DAC position.
#[derive(Debug, Default)]
pub struct PositionCell(AtomicU32);

impl PositionCell {
    pub fn new(point: DacPoint) -> Self {
        Self(AtomicU32::new(pack(point)))
    }

    pub fn load(&self) -> DacPoint {
        unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, point: DacPoint) {
        self.0.store(pack(point), Ordering::Release);
    }
}

fn pack(point: DacPoint) -> u32 {
    (u32::from(point.x as u16) << 16) | u32::from(point.y as u16)
}

fn unpack(bits: u32) -> DacPoint {
    DacPoint::new((bits >> 16) as u16 as i16, bits as u16 as i16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use microbeam_core::{DAC_MAX, DAC_MIN};

    #[test]
    fn test_position_cell_roundtrip() {
        let cell = PositionCell::default();
        assert_eq!(cell.load(), DacPoint::ORIGIN);

        for point in [
            DacPoint::new(DAC_MIN, DAC_MAX),
            DacPoint::new(-1, 1),
            DacPoint::new(DAC_MAX, DAC_MIN),
            DacPoint::new(-100, 0),
        ] {
            cell.store(point);
            assert_eq!(cell.load(), point);
        }
    }

    #[test]
    fn test_edge_levels() {
        assert_eq!(TriggerEdge::Falling.level_after(), Level::Low);
        assert_eq!(TriggerEdge::Rising.level_after(), Level::High);
        assert_eq!(Level::Low.inverted(), Level::High);
    }
}

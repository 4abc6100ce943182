//! Simulated trigger backend.
//!
//! Particle arrivals follow a Gaussian inter-arrival time (clamped at zero)
//! from a seeded ChaCha RNG. A pulse only reaches the trigger line while the
//! shutter is open and the beam sits on a sensitive spot of the optional
//! periodic grid. The edge program runs unchanged through the interpreter,
//! so shutter gating and edge qualification behave as on hardware.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use microbeam_core::{DacPoint, HitBatch};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{Level, PositionCell, TriggerBackend, TriggerConfig};
use crate::error::{HardwareError, HardwareResult};
use crate::program::{EdgeProgram, ProgramIo, ProgramShape, TICK_PARAM};

// ============================================================================
// Configuration
// ============================================================================

/// Statistical hit model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Mean time between particles in microseconds
    pub mean_interval_us: f64,
    /// Standard deviation of the inter-arrival time in microseconds
    pub jitter_us: f64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
    pub grid: Option<SensitivityGrid>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mean_interval_us: 100.0,
            jitter_us: 500.0,
            seed: None,
            grid: None,
        }
    }
}

/// Periodic structure on the target: only the first `window_lsb` codes of
/// every `period_lsb` codes on both axes produce hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivityGrid {
    pub period_lsb: u32,
    pub window_lsb: u32,
}

impl SensitivityGrid {
    pub fn is_sensitive(&self, point: DacPoint) -> bool {
        if self.period_lsb == 0 {
            return true;
        }
        let period = i64::from(self.period_lsb);
        let window = i64::from(self.window_lsb);
        i64::from(point.x).rem_euclid(period) < window
            && i64::from(point.y).rem_euclid(period) < window
    }
}

// ============================================================================
// Backend
// ============================================================================

struct SimLine {
    rng: ChaCha8Rng,
    level: Level,
}

/// Backend without hardware, used with `--simulate` and in tests.
pub struct SimulatedBackend {
    config: TriggerConfig,
    sim: SimulationConfig,
    position: PositionCell,
    shutter_open: AtomicBool,
    program: Mutex<Option<EdgeProgram>>,
    line: Mutex<SimLine>,
    epoch: Instant,
}

impl SimulatedBackend {
    pub fn new(config: TriggerConfig, sim: SimulationConfig) -> Self {
        let rng = match sim.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        info!(
            mean_interval_us = sim.mean_interval_us,
            jitter_us = sim.jitter_us,
            seed = ?sim.seed,
            grid = ?sim.grid,
            "Simulated trigger backend ready"
        );
        Self {
            line: Mutex::new(SimLine {
                rng,
                level: idle_level(&config),
            }),
            config,
            sim,
            position: PositionCell::default(),
            shutter_open: AtomicBool::new(false),
            program: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    /// Whether the simulated shutter currently passes the beam.
    pub fn is_shutter_open(&self) -> bool {
        self.shutter_open.load(Ordering::Acquire)
    }

    fn set_shutter(&self, level: u32) {
        let open = level == self.config.shutter_open_level.value();
        self.shutter_open.store(open, Ordering::Release);
    }

    fn beam_reaches_trigger(&self) -> bool {
        if !self.is_shutter_open() {
            return false;
        }
        match &self.sim.grid {
            Some(grid) => grid.is_sensitive(self.position.load()),
            None => true,
        }
    }

    fn tick(&self) -> u32 {
        // wraps like the hardware tick
        self.epoch.elapsed().as_micros() as u32
    }
}

fn idle_level(config: &TriggerConfig) -> Level {
    config.edge.level_after().inverted()
}

/// Gaussian sample via Box-Muller, clamped at zero.
fn next_interval_us(rng: &mut ChaCha8Rng, mean: f64, jitter: f64) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
    (mean + jitter * z).max(0.0)
}

struct SimIo<'a> {
    backend: &'a SimulatedBackend,
    line: &'a mut SimLine,
}

#[async_trait]
impl ProgramIo for SimIo<'_> {
    async fn write(&mut self, gpio: u32, level: u32) -> HardwareResult<()> {
        if gpio == self.backend.config.gpio.shutter {
            self.backend.set_shutter(level);
        }
        Ok(())
    }

    async fn read(&mut self, gpio: u32) -> HardwareResult<u32> {
        if gpio == self.backend.config.gpio.trigger {
            Ok(self.line.level.value())
        } else {
            Ok(0)
        }
    }

    async fn wait(&mut self, mask: u32) -> HardwareResult<u32> {
        let trigger_bit = 1u32.checked_shl(self.backend.config.gpio.trigger).unwrap_or(0);
        if mask & trigger_bit == 0 {
            std::future::pending::<()>().await;
        }

        let idle = idle_level(&self.backend.config);
        // trailing edge of the pulse in progress
        if self.line.level != idle {
            self.line.level = idle;
            return Ok(trigger_bit);
        }

        loop {
            let interval = next_interval_us(
                &mut self.line.rng,
                self.backend.sim.mean_interval_us,
                self.backend.sim.jitter_us,
            );
            if interval < 1.0 {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_secs_f64(interval * 1e-6)).await;
            }
            if self.backend.beam_reaches_trigger() {
                self.line.level = idle.inverted();
                return Ok(trigger_bit);
            }
        }
    }

    fn tick(&mut self) -> u32 {
        self.backend.tick()
    }
}

#[async_trait]
impl TriggerBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn set_position(&self, point: DacPoint) -> HardwareResult<()> {
        self.position.store(point);
        debug!(x = point.x, y = point.y, "DAC written");
        Ok(())
    }

    fn position(&self) -> DacPoint {
        self.position.load()
    }

    async fn open_shutter(&self) -> HardwareResult<()> {
        self.set_shutter(self.config.shutter_open_level.value());
        debug!("Shutter opened");
        Ok(())
    }

    async fn close_shutter(&self) -> HardwareResult<()> {
        self.set_shutter(self.config.shutter_closed_level().value());
        debug!("Shutter closed");
        Ok(())
    }

    async fn prepare(&self, hits_per_batch: u32) -> HardwareResult<()> {
        let program = EdgeProgram::compile(ProgramShape::for_batch(hits_per_batch), &self.config);
        debug!(script = %program.to_script(), "Edge program prepared");
        *self.program.lock().await = Some(program);
        Ok(())
    }

    async fn arm_and_wait(&self, cancel: &CancellationToken) -> HardwareResult<Option<HitBatch>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let program = self
            .program
            .lock()
            .await
            .clone()
            .ok_or(HardwareError::NotPrepared)?;
        let shape = program.shape();
        let mut registers = shape.registers();

        let mut line = self.line.lock().await;
        let mut io = SimIo {
            backend: self,
            line: &mut *line,
        };

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = program.execute(&mut io, &mut registers) => {
                result?;
                true
            }
        };

        let tick = if finished {
            registers.get(TICK_PARAM.index()).copied().unwrap_or(0) as u32
        } else {
            // abandoned mid-program, the shutter may still be open
            self.set_shutter(self.config.shutter_closed_level().value());
            self.tick()
        };
        let count = shape.counted(&registers);
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(HitBatch {
            hw_timestamp_us: tick,
            wall_timestamp: Utc::now(),
            position: self.position.load(),
            count,
            latch_up: None,
        }))
    }

    async fn disarm(&self) -> HardwareResult<()> {
        self.close_shutter().await
    }

    fn min_hit_delay(&self) -> Duration {
        self.config.min_hit_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(grid: Option<SensitivityGrid>) -> SimulatedBackend {
        SimulatedBackend::new(
            TriggerConfig::default(),
            SimulationConfig {
                seed: Some(7),
                grid,
                ..SimulationConfig::default()
            },
        )
    }

    #[test]
    fn test_grid_sensitivity() {
        let grid = SensitivityGrid {
            period_lsb: 1000,
            window_lsb: 200,
        };
        assert!(grid.is_sensitive(DacPoint::new(0, 0)));
        assert!(grid.is_sensitive(DacPoint::new(-900, 1100)));
        assert!(!grid.is_sensitive(DacPoint::new(500, 0)));
        assert!(!grid.is_sensitive(DacPoint::new(0, -100)));
    }

    #[test]
    fn test_intervals_are_non_negative_and_seeded() {
        let mut a = ChaCha8Rng::seed_from_u64(1);
        let mut b = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            let x = next_interval_us(&mut a, 100.0, 500.0);
            assert!(x >= 0.0);
            assert_eq!(x, next_interval_us(&mut b, 100.0, 500.0));
        }
    }

    #[tokio::test]
    async fn test_arm_requires_prepare() {
        let sim = backend(None);
        let result = sim.arm_and_wait(&CancellationToken::new()).await;
        assert!(matches!(result, Err(HardwareError::NotPrepared)));
    }

    #[tokio::test]
    async fn test_batch_reports_position_and_closes_shutter() {
        let sim = backend(None);
        sim.set_position(DacPoint::new(-100, 40)).await.unwrap();
        sim.prepare(3).await.unwrap();

        let batch = tokio::time::timeout(
            Duration::from_secs(5),
            sim.arm_and_wait(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();

        assert_eq!(batch.count, 3);
        assert_eq!(batch.position, DacPoint::new(-100, 40));
        assert!(!sim.is_shutter_open());
    }

    #[tokio::test]
    async fn test_insensitive_spot_waits_until_cancelled() {
        let sim = backend(Some(SensitivityGrid {
            period_lsb: 1000,
            window_lsb: 10,
        }));
        sim.set_position(DacPoint::new(500, 500)).await.unwrap();
        sim.prepare(1).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), sim.arm_and_wait(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(!sim.is_shutter_open());
    }

    #[tokio::test]
    async fn test_cancel_reports_edges_already_counted() {
        let sim = backend(None);
        sim.prepare(1_000_000).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let batch = tokio::time::timeout(Duration::from_secs(5), sim.arm_and_wait(&cancel))
            .await
            .unwrap()
            .unwrap()
            .expect("edges counted before the cancel are reported");
        assert!(batch.count > 0 && batch.count < 1_000_000, "{}", batch.count);
        assert!(!sim.is_shutter_open());
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_arming() {
        let sim = backend(None);
        sim.prepare(1).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(sim.arm_and_wait(&cancel).await.unwrap().is_none());
    }
}

//! Scan generator: walks the grid and decides when each step ends.
//!
//! Runs as a task spawned by the controller for the duration of one run.
//! It owns the beam position and the latch channel while it runs, and
//! reports everything that changes run counters back to the controller as
//! [`ScanEvent`]s, so counters are only ever written by the actor.
//!
//! A step ends on the first of:
//! - the hit quota is reached
//! - the tick budget (`step_timeout / min_hit_delay`) is used up
//! - the run is stopped
//! - the latch channel delivers a waveform
//!
//! Step hits are read from the pump, which restarts its count with every
//! step, so batches still queued for the controller never spill into the
//! next step.
//!
//! With ack-gating the primary subscriber's `ack` is raced against the
//! ticks. An `ack` before half of the quota arrived aborts the whole scan;
//! otherwise the step is acknowledged and the scan waits for the ack before
//! advancing if the step ended first.

use std::sync::Arc;
use std::time::Duration;

use microbeam_core::{DacPoint, ScanOrder, ScanPlan};
use microbeam_hw::{PumpHandle, TriggerBackend};
use microbeam_protocol::SubscriberMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::latch::LatchMonitor;
use crate::subscribers::SubscriberHub;

/// What the scan reports to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The beam moved to point `index` (0-based) of `total`
    StepStarted {
        index: u64,
        total: u64,
        point: DacPoint,
    },
    /// A step ended without reaching its quota
    StepTimedOut,
    /// A step completed and counts as done
    PointDone,
    /// The latch channel delivered a waveform
    LatchUp {
        /// 1-based number within the run
        number: u64,
        /// Run hit count when the latch-up was seen
        hit_count: u64,
        point: DacPoint,
        samples: Vec<f64>,
    },
    /// Later repetitions run with swapped loop order
    AxesSwapped,
}

/// Why a scan ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Stopped,
    /// The primary acknowledged before half the quota arrived
    EarlyAck,
    PrimaryLost,
    Hardware(String),
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState {
    NotRequired,
    Pending,
    Acked,
}

enum StepEnd {
    Quota,
    Timeout,
    Latch,
}

enum Tick {
    Cancelled,
    Ack(Option<bool>),
    Elapsed,
}

/// Totals carried from step to step.
#[derive(Debug, Default)]
struct RunTally {
    hits: u64,
    latch_ups: u64,
}

/// An ack with fewer than half of the quota counted aborts the scan.
fn acked_too_early(hits: u64, quota: u64) -> bool {
    hits.saturating_mul(2) < quota
}

/// Everything a scan needs, moved into its task.
pub(crate) struct ScanTask {
    pub plan: ScanPlan,
    pub backend: Arc<dyn TriggerBackend>,
    pub pump: PumpHandle,
    pub hub: SubscriberHub,
    pub latch: Option<LatchMonitor>,
    pub events: mpsc::UnboundedSender<ScanEvent>,
    pub cancel: CancellationToken,
    pub hits_per_batch: u32,
    pub wait_for_ack: bool,
    pub swap_axes: bool,
    pub latch_recovery: Duration,
}

impl ScanTask {
    pub async fn run(mut self) -> ScanOutcome {
        let outcome = match self.scan().await {
            Ok(()) => ScanOutcome::Completed,
            Err(reason) => ScanOutcome::Aborted(reason),
        };
        self.wind_down().await;
        outcome
    }

    async fn scan(&mut self) -> Result<(), AbortReason> {
        self.backend
            .prepare(self.hits_per_batch)
            .await
            .map_err(|e| AbortReason::Hardware(e.to_string()))?;
        self.backend
            .close_shutter()
            .await
            .map_err(|e| AbortReason::Hardware(e.to_string()))?;

        let total = self.plan.total_points();
        let mut index = 0u64;
        let mut tally = RunTally::default();

        for repetition in 0..self.plan.repeat_count {
            let order = ScanOrder::for_repetition(repetition, self.swap_axes);
            match order {
                ScanOrder::ColumnMajor => {
                    warn!(repetition, "Changing scan sequence to x outer, y inner")
                }
                ScanOrder::RowMajor => {
                    info!(repetition, "Default scan sequence: y outer, x inner")
                }
            }

            for point in self.plan.points(order) {
                if self.cancel.is_cancelled() {
                    return Err(AbortReason::Stopped);
                }
                let _ = self.events.send(ScanEvent::StepStarted {
                    index,
                    total,
                    point,
                });
                self.step(point, &mut tally).await?;
                let _ = self.events.send(ScanEvent::PointDone);
                index += 1;
            }

            if self.swap_axes && repetition == 1 {
                let _ = self.events.send(ScanEvent::AxesSwapped);
            }
        }

        Ok(())
    }

    /// One grid point. `Ok` means the point counts as done.
    async fn step(&mut self, point: DacPoint, tally: &mut RunTally) -> Result<(), AbortReason> {
        self.backend
            .set_position(point)
            .await
            .map_err(|e| AbortReason::Hardware(e.to_string()))?;
        self.hub.broadcast(&SubscriberMessage::Pos(point)).await;

        let quota = u64::from(self.plan.hits_per_step);
        let tick = self.backend.min_hit_delay();
        let budget = self.plan.step_tick_budget(tick);
        let mut ack = if self.wait_for_ack {
            AckState::Pending
        } else {
            AckState::NotRequired
        };

        self.pump.deliver(quota);

        let mut ticks = 0u64;
        let end = loop {
            if self.pump.step_hits() >= quota {
                break StepEnd::Quota;
            }
            if ticks >= budget {
                break StepEnd::Timeout;
            }

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Tick::Cancelled,
                result = self.hub.read_ack(), if ack == AckState::Pending => Tick::Ack(result),
                _ = tokio::time::sleep(tick) => Tick::Elapsed,
            };

            match event {
                Tick::Cancelled => {
                    self.end_step().await;
                    return Err(AbortReason::Stopped);
                }
                Tick::Ack(Some(true)) => {
                    let hits = self.pump.step_hits();
                    if acked_too_early(hits, quota) {
                        warn!(
                            hits,
                            quota,
                            "Step acknowledged before half of the hits arrived. Aborting scan!"
                        );
                        self.end_step().await;
                        self.hub.broadcast(&SubscriberMessage::Abort).await;
                        return Err(AbortReason::EarlyAck);
                    }
                    info!(hits, quota, "Step acknowledged");
                    ack = AckState::Acked;
                }
                Tick::Ack(Some(false)) => {}
                Tick::Ack(None) => {
                    error!("Primary subscriber gone during ack-gated scan");
                    self.end_step().await;
                    return Err(AbortReason::PrimaryLost);
                }
                Tick::Elapsed => {
                    if let Some(samples) = self.poll_latch() {
                        tally.latch_ups += 1;
                        self.pump.mark_latch(tally.latch_ups);
                        self.end_step().await;
                        let hit_count = tally.hits + self.pump.step_hits();
                        let _ = self.events.send(ScanEvent::LatchUp {
                            number: tally.latch_ups,
                            hit_count,
                            point,
                            samples,
                        });
                        warn!(
                            recovery = ?self.latch_recovery,
                            "LATCH-UP detected, waiting for recovery"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(AbortReason::Stopped),
                            _ = tokio::time::sleep(self.latch_recovery) => {}
                        }
                        break StepEnd::Latch;
                    }
                    ticks += 1;
                }
            }
        };

        if !matches!(end, StepEnd::Latch) {
            self.end_step().await;
        }
        let step_hits = self.pump.step_hits();
        tally.hits += step_hits;
        match end {
            StepEnd::Quota => {}
            StepEnd::Timeout => {
                info!(ticks, tick = ?tick, "Step timeout reached, moving on");
                let _ = self.events.send(ScanEvent::StepTimedOut);
            }
            StepEnd::Latch => {
                let _ = self.events.send(ScanEvent::StepTimedOut);
            }
        }
        debug!(hits = step_hits, quota, "Step finished");

        if ack == AckState::Pending {
            self.await_ack().await?;
        }
        Ok(())
    }

    /// Waits for the primary's ack after the step already ended.
    ///
    /// The half-quota rule only applies while the step is still counting;
    /// an ack after a timeout always advances.
    async fn await_ack(&mut self) -> Result<(), AbortReason> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AbortReason::Stopped),
                result = self.hub.read_ack() => match result {
                    Some(true) => {
                        info!("Step acknowledged");
                        return Ok(());
                    }
                    Some(false) => {}
                    None => {
                        error!("Primary subscriber gone during ack-gated scan");
                        return Err(AbortReason::PrimaryLost);
                    }
                },
            }
        }
    }

    fn poll_latch(&mut self) -> Option<Vec<f64>> {
        let latch = self.latch.as_mut()?;
        match latch.try_read() {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "Latch channel read failed");
                None
            }
        }
    }

    /// Stops counting and closes the shutter.
    async fn end_step(&self) {
        self.pump.halt().await;
        if let Err(e) = self.backend.close_shutter().await {
            error!(error = %e, "Failed to close shutter");
        }
    }

    /// Safe state after the last step, completed or not.
    async fn wind_down(&mut self) {
        self.end_step().await;
        if let Some(number) = self.pump.clear_latch_mark() {
            debug!(number, "No hit followed the last latch-up");
        }
        if let Err(e) = self.backend.set_position(DacPoint::ORIGIN).await {
            error!(error = %e, "Failed to move beam to origin");
        }
        self.hub.broadcast(&SubscriberMessage::StopRun).await;
        if let Err(e) = self.backend.disarm().await {
            warn!(error = %e, "Failed to disarm trigger backend");
        }
        self.latch = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_quota_boundary() {
        assert!(!acked_too_early(2, 4));
        assert!(acked_too_early(2, 5));
        assert!(!acked_too_early(3, 5));
        assert!(acked_too_early(0, 1));
        assert!(!acked_too_early(0, 0));
        assert!(!acked_too_early(u64::MAX, 10));
    }
}

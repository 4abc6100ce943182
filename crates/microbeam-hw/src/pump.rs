//! Hit pump: the single producer of hit batches.
//!
//! The pump owns the arm/wait cycle of a backend and forwards every
//! completed batch into a bounded channel consumed by the run controller.
//! The scan asks for a number of hits with [`PumpHandle::deliver`] and ends
//! a step with [`PumpHandle::halt`], which returns only once the pump is
//! idle and any batch it completed is already queued. The pump counts the
//! hits of each step itself, so a batch still waiting in the channel is
//! never mistaken for a hit of the following step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use microbeam_core::HitBatch;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::TriggerBackend;

/// Default capacity of the hit channel.
pub const HIT_CHANNEL_CAPACITY: usize = 1024;

/// Pause after a failed arm before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct PumpShared {
    /// Hits still requested for the current step
    budget: watch::Sender<u64>,
    busy: watch::Sender<bool>,
    arm_token: Mutex<CancellationToken>,
    hits_seen: AtomicU64,
    /// Hits since the last `deliver`
    step_hits: AtomicU64,
    /// Latch-up number for the next batch
    latch_mark: Mutex<Option<u64>>,
}

impl PumpShared {
    fn arm_token(&self) -> CancellationToken {
        self.arm_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn latch_mark(&self) -> MutexGuard<'_, Option<u64>> {
        self.latch_mark.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Control side of the hit pump.
#[derive(Clone)]
pub struct PumpHandle {
    shared: Arc<PumpShared>,
}

impl PumpHandle {
    /// Starts a step: requests `hits` hits, arming as often as needed, and
    /// restarts the step hit count.
    pub fn deliver(&self, hits: u64) {
        self.shared.step_hits.store(0, Ordering::Release);
        *self
            .shared
            .arm_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.shared.budget.send_replace(hits);
    }

    /// Cancels any armed program and waits until the pump is idle.
    pub async fn halt(&self) {
        self.shared.budget.send_replace(0);
        self.shared.arm_token().cancel();
        let mut busy = self.shared.busy.subscribe();
        // Err means the pump task is gone, which is idle too
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Hits requested but not yet seen.
    pub fn remaining(&self) -> u64 {
        *self.shared.budget.borrow()
    }

    /// Hits reported since the last [`deliver`](Self::deliver), including a
    /// batch completed while halting.
    pub fn step_hits(&self) -> u64 {
        self.shared.step_hits.load(Ordering::Acquire)
    }

    /// Tags the next reported batch with latch-up `number`.
    pub fn mark_latch(&self, number: u64) {
        *self.shared.latch_mark() = Some(number);
    }

    /// Drops a latch-up mark no batch picked up.
    pub fn clear_latch_mark(&self) -> Option<u64> {
        self.shared.latch_mark().take()
    }

    /// Every hit the backend reported since the pump started, run or not.
    pub fn hits_seen(&self) -> u64 {
        self.shared.hits_seen.load(Ordering::Relaxed)
    }
}

/// Starts the pump task.
///
/// Returns the control handle and the receiving end of the hit channel.
pub fn spawn_hit_pump(
    backend: Arc<dyn TriggerBackend>,
    capacity: usize,
    shutdown: CancellationToken,
) -> (PumpHandle, mpsc::Receiver<HitBatch>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (budget, _) = watch::channel(0u64);
    let (busy, _) = watch::channel(false);
    let shared = Arc::new(PumpShared {
        budget,
        busy,
        arm_token: Mutex::new(CancellationToken::new()),
        hits_seen: AtomicU64::new(0),
        step_hits: AtomicU64::new(0),
        latch_mark: Mutex::new(None),
    });

    let pump = HitPump {
        backend,
        shared: Arc::clone(&shared),
        tx,
        shutdown,
    };
    tokio::spawn(pump.run());

    (PumpHandle { shared }, rx)
}

struct HitPump {
    backend: Arc<dyn TriggerBackend>,
    shared: Arc<PumpShared>,
    tx: mpsc::Sender<HitBatch>,
    shutdown: CancellationToken,
}

impl HitPump {
    async fn run(self) {
        let mut budget = self.shared.budget.subscribe();
        debug!(backend = self.backend.name(), "Hit pump started");

        loop {
            let requested = tokio::select! {
                _ = self.shutdown.cancelled() => false,
                result = budget.wait_for(|remaining| *remaining > 0) => result.is_ok(),
            };
            if !requested {
                break;
            }

            let token = self.shared.arm_token();
            self.shared.busy.send_replace(true);
            let keep_running = self.arm_once(&token).await;
            self.shared.busy.send_replace(false);

            if !keep_running {
                break;
            }
        }

        self.shared.busy.send_replace(false);
        debug!("Hit pump stopped");
    }

    /// One arm/wait cycle. Returns false once the consumer is gone.
    async fn arm_once(&self, token: &CancellationToken) -> bool {
        match self.backend.arm_and_wait(token).await {
            Ok(Some(mut batch)) => {
                batch.latch_up = self.shared.latch_mark().take();
                let count = u64::from(batch.count);
                self.shared.hits_seen.fetch_add(count, Ordering::Relaxed);
                self.shared.step_hits.fetch_add(count, Ordering::AcqRel);
                self.shared
                    .budget
                    .send_modify(|remaining| *remaining = remaining.saturating_sub(count));
                self.tx.send(batch).await.is_ok()
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Hit batch acquisition failed");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TriggerConfig;
    use crate::simulator::{SimulatedBackend, SimulationConfig};
    use microbeam_core::DacPoint;

    fn simulated() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(
            TriggerConfig::default(),
            SimulationConfig {
                seed: Some(11),
                ..SimulationConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_pump_idle_until_delivery() {
        let backend = simulated();
        backend.prepare(1).await.unwrap();
        let shutdown = CancellationToken::new();
        let (pump, mut rx) = spawn_hit_pump(backend, 16, shutdown.clone());

        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(nothing.is_err(), "pump produced hits without a request");
        assert_eq!(pump.hits_seen(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_pump_delivers_requested_hits() {
        let backend = simulated();
        backend.prepare(1).await.unwrap();
        backend.set_position(DacPoint::new(12, -3)).await.unwrap();
        let shutdown = CancellationToken::new();
        let (pump, mut rx) = spawn_hit_pump(backend.clone(), 16, shutdown.clone());

        pump.deliver(3);
        let mut total = 0;
        while total < 3 {
            let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(batch.position, DacPoint::new(12, -3));
            total += batch.count;
        }

        pump.halt().await;
        assert_eq!(pump.remaining(), 0);
        assert_eq!(pump.hits_seen(), 3);
        assert_eq!(pump.step_hits(), 3);

        pump.deliver(1);
        assert_eq!(pump.step_hits(), 0, "a new step starts from zero");
        pump.halt().await;
        assert!(!backend.is_shutter_open());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_latch_mark_goes_to_next_batch_only() {
        let backend = simulated();
        backend.prepare(1).await.unwrap();
        let shutdown = CancellationToken::new();
        let (pump, mut rx) = spawn_hit_pump(backend, 16, shutdown.clone());

        pump.mark_latch(4);
        pump.deliver(2);
        let mut batches = Vec::new();
        while batches.len() < 2 {
            let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            batches.push(batch);
        }
        pump.halt().await;

        assert_eq!(batches[0].latch_up, Some(4));
        assert_eq!(batches[1].latch_up, None);
        assert_eq!(pump.clear_latch_mark(), None);

        pump.mark_latch(5);
        assert_eq!(pump.clear_latch_mark(), Some(5));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_halt_stops_pending_request() {
        let backend = simulated();
        backend.prepare(1).await.unwrap();
        let shutdown = CancellationToken::new();
        let (pump, mut rx) = spawn_hit_pump(backend.clone(), 1024, shutdown.clone());

        pump.deliver(u64::MAX);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(5), pump.halt())
            .await
            .unwrap();

        // drain whatever arrived before the halt, then nothing more
        while rx.try_recv().is_ok() {}
        let late = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(late.is_err());
        assert!(!backend.is_shutter_open());
        shutdown.cancel();
    }
}

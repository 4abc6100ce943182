//! Run controller actor - owns the run state machine.
//!
//! The actor is the only writer of run state: the Idle/Active state, the
//! counters, the in-memory hit list and the run's files. It multiplexes
//! three inputs in one loop: commands from handles, hit batches from the
//! pump, and events from the scan task. Because each input is applied
//! between two suspension points, no counter update is ever split.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored; the requester may have gone away
//! - Run integrity checks are `debug_assert!`s

use std::sync::Arc;

use microbeam_core::{
    Calibration, DacPoint, HitBatch, PollCursor, RunId, RunState, RunStatus, ScanParameters,
    ScanPlan, ScanUnit,
};
use microbeam_hw::{PumpHandle, TriggerBackend};
use microbeam_protocol::{PollReport, SubscriberMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{ControlCommand, ControlError};
use super::scan::{AbortReason, ScanEvent, ScanOutcome, ScanTask};
use super::ControllerSettings;
use crate::run_log::RunLogFile;
use crate::storage::{RunFiles, RunIdStore, StorageError, WaveformTable};
use crate::subscribers::SubscriberHub;

/// Counters of the current (or last) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RunCounters {
    scan_points: u64,
    scan_points_done: u64,
    hit_count: u64,
    timeout_counter: u64,
    latch_counter: u64,
}

struct ActiveScan {
    handle: JoinHandle<ScanOutcome>,
    cancel: CancellationToken,
}

/// Collaborators the controller drives.
pub struct ControllerParts {
    pub backend: Arc<dyn TriggerBackend>,
    pub pump: PumpHandle,
    pub hits: mpsc::Receiver<HitBatch>,
    pub hub: SubscriberHub,
    pub run_log: RunLogFile,
    pub run_ids: RunIdStore,
    pub calibration: Calibration,
}

/// The run controller actor.
pub struct RunController {
    receiver: mpsc::Receiver<ControlCommand>,
    hits: mpsc::Receiver<HitBatch>,
    scan_events: mpsc::UnboundedReceiver<ScanEvent>,
    scan_event_tx: mpsc::UnboundedSender<ScanEvent>,
    scan: Option<ActiveScan>,
    /// Stop requests answered once the scan has unwound
    pending_stops: Vec<oneshot::Sender<Result<(), ControlError>>>,

    backend: Arc<dyn TriggerBackend>,
    pump: PumpHandle,
    hub: SubscriberHub,
    run_log: RunLogFile,
    settings: ControllerSettings,
    run_ids: RunIdStore,
    calibration: Calibration,
    shutdown: CancellationToken,

    state: RunState,
    run_id: Option<RunId>,
    counters: RunCounters,
    /// One entry per hit of the current run, in arrival order
    hit_list: Vec<DacPoint>,
    files: Option<RunFiles>,
    waveforms: WaveformTable,
}

impl RunController {
    pub fn new(
        receiver: mpsc::Receiver<ControlCommand>,
        parts: ControllerParts,
        settings: ControllerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (scan_event_tx, scan_events) = mpsc::unbounded_channel();
        let run_id = parts.run_ids.last();

        Self {
            receiver,
            hits: parts.hits,
            scan_events,
            scan_event_tx,
            scan: None,
            pending_stops: Vec::new(),
            backend: parts.backend,
            pump: parts.pump,
            hub: parts.hub,
            run_log: parts.run_log,
            settings,
            run_ids: parts.run_ids,
            calibration: parts.calibration,
            shutdown,
            state: RunState::Idle,
            run_id,
            counters: RunCounters::default(),
            hit_list: Vec::new(),
            files: None,
            waveforms: WaveformTable::new(),
        }
    }

    /// Runs the actor until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            backend = self.backend.name(),
            run_dir = %self.settings.run_dir.display(),
            last_run = ?self.run_id,
            calibrated = self.calibration.is_calibrated(),
            "Run controller starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(batch) = self.hits.recv() => self.handle_hits(batch),

                Some(event) = self.scan_events.recv() => self.handle_scan_event(event),

                result = join_scan(&mut self.scan) => {
                    self.scan = None;
                    self.finish_run(result).await;
                }
            }
        }

        if let Some(scan) = self.scan.take() {
            info!("Stopping active run for shutdown");
            scan.cancel.cancel();
            let result = scan.handle.await;
            self.finish_run(result).await;
        }
        if let Err(e) = self.backend.shutdown().await {
            warn!(error = %e, "Trigger backend shutdown failed");
        }

        info!(hits_seen = self.pump.hits_seen(), "Run controller stopped");
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::WriteDac {
                x,
                y,
                unit,
                respond_to,
            } => {
                let result = self.handle_write_dac(x, y, unit).await;
                let _ = respond_to.send(result);
            }
            ControlCommand::StartRun { params, respond_to } => {
                let result = self.handle_start_run(*params).await;
                let _ = respond_to.send(result);
            }
            ControlCommand::StopRun { respond_to } => self.handle_stop_run(respond_to),
            ControlCommand::Poll { cursor, respond_to } => {
                let _ = respond_to.send(self.handle_poll(cursor));
            }
            ControlCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_write_dac(
        &mut self,
        x: f64,
        y: f64,
        unit: ScanUnit,
    ) -> Result<DacPoint, ControlError> {
        if self.state == RunState::Active {
            warn!("DAC write rejected, the active scan owns the beam");
            return Err(ControlError::RunActive);
        }

        let point = unit.point_to_lsb(x, y, &self.calibration)?;
        self.backend
            .set_position(point)
            .await
            .map_err(|e| ControlError::Hardware(e.to_string()))?;
        info!(x = point.x, y = point.y, %unit, "Setting DAC to {point}");
        Ok(point)
    }

    async fn handle_start_run(&mut self, params: ScanParameters) -> Result<RunId, ControlError> {
        if self.state == RunState::Active {
            warn!("Not starting a new run (system state not IDLE)");
            return Err(ControlError::RunActive);
        }

        let plan = params.plan(&self.calibration).map_err(|e| {
            warn!(error = %e, "Run parameters rejected");
            ControlError::from(e)
        })?;

        if self.settings.wait_for_client_ack && !self.hub.has_primary() {
            error!("TCP client required for run control, but none connected. Aborting run.");
            return Err(ControlError::NoPrimarySubscriber);
        }

        let latch = match &self.settings.latch {
            Some(source) => Some(source.open().map_err(|e| {
                error!(source = %source.describe(), error = %e, "Cannot open latch-up channel");
                ControlError::LatchChannel(format!("{}: {e}", source.describe()))
            })?),
            None => None,
        };

        let run_id = self.run_ids.allocate().map_err(storage_error)?;
        let files = RunFiles::create(&self.settings.run_dir, run_id).map_err(storage_error)?;
        if let Err(e) = self.run_log.attach(&files.log_path()) {
            warn!(error = %e, "Failed to open run log");
        }

        info!(run_id = %run_id, dir = %files.dir().display(), "Start of run {run_id}");
        self.log_parameters(&params, &plan);
        if self.settings.simulated {
            warn!("HIT SIMULATION MODE ACTIVATED!");
        }

        self.hub
            .broadcast(&SubscriberMessage::StartRun { id: run_id })
            .await;

        self.state = RunState::Active;
        self.run_id = Some(run_id);
        self.counters = RunCounters {
            scan_points: plan.total_points(),
            ..RunCounters::default()
        };
        self.hit_list.clear();
        self.waveforms = WaveformTable::new();
        self.files = Some(files);

        let cancel = self.shutdown.child_token();
        let task = ScanTask {
            plan,
            backend: Arc::clone(&self.backend),
            pump: self.pump.clone(),
            hub: self.hub.clone(),
            latch,
            events: self.scan_event_tx.clone(),
            cancel: cancel.clone(),
            hits_per_batch: self.settings.hits_per_batch,
            wait_for_ack: self.settings.wait_for_client_ack,
            swap_axes: self.settings.swap_xy_every_second_repetition,
            latch_recovery: self.settings.latch_recovery,
        };
        self.scan = Some(ActiveScan {
            handle: tokio::spawn(task.run()),
            cancel,
        });

        Ok(run_id)
    }

    fn log_parameters(&self, params: &ScanParameters, plan: &ScanPlan) {
        info!("Scan unit: {}", params.unit);
        info!(
            "X Start: {}, X Stop: {}, X Points: {}",
            params.start_x, params.stop_x, params.points_x
        );
        info!(
            "Y Start: {}, Y Stop: {}, Y Points: {}",
            params.start_y, params.stop_y, params.points_y
        );
        info!(
            "Hits per step: {}, Step timeout: {} s, Repeat count: {}",
            params.hits_per_step, params.step_timeout, params.repeat_count
        );
        info!(
            "X scale: {} LSB/micrometer, Y scale: {} LSB/micrometer",
            self.calibration.lsb_per_um_x, self.calibration.lsb_per_um_y
        );
        debug!(x = ?plan.x_values, y = ?plan.y_values, "Scan grid in LSB");
        info!(
            points = plan.total_points(),
            ack_gating = self.settings.wait_for_client_ack,
            latch_channel = ?self.settings.latch.as_ref().map(|l| l.describe()),
            "Scan configured"
        );
    }

    fn handle_stop_run(&mut self, respond_to: oneshot::Sender<Result<(), ControlError>>) {
        match &self.scan {
            Some(scan) => {
                info!(run_id = ?self.run_id, "Stopping run");
                scan.cancel.cancel();
                self.pending_stops.push(respond_to);
            }
            None => {
                warn!("No run to stop");
                let _ = respond_to.send(Err(ControlError::NotActive));
            }
        }
    }

    fn handle_poll(&self, mut cursor: PollCursor) -> (PollReport, PollCursor) {
        let range = cursor.advance(self.run_id, self.hit_list.len());
        let new_hits = self
            .hit_list
            .get(range)
            .map(<[DacPoint]>::to_vec)
            .unwrap_or_default();
        if !new_hits.is_empty() {
            debug!(count = new_hits.len(), "Delivering hits to poll client");
        }

        let dac = self.backend.position();
        let report = PollReport {
            state: self.state,
            run_id: self.run_id,
            dac_x: dac.x,
            dac_y: dac.y,
            scan_points: self.counters.scan_points,
            scan_points_done: self.counters.scan_points_done,
            new_hits,
        };
        (report, cursor)
    }

    fn status(&self) -> RunStatus {
        RunStatus {
            state: self.state,
            run_id: self.run_id,
            dac: self.backend.position(),
            scan_points: self.counters.scan_points,
            scan_points_done: self.counters.scan_points_done,
            hit_count: self.counters.hit_count,
            timeout_counter: self.counters.timeout_counter,
            latch_counter: self.counters.latch_counter,
        }
    }

    // ------------------------------------------------------------------------
    // Hits and scan events
    // ------------------------------------------------------------------------

    fn handle_hits(&mut self, batch: HitBatch) {
        if self.state != RunState::Active {
            debug!(count = batch.count, "Hit batch outside of a run dropped");
            return;
        }
        debug_assert!(self.files.is_some(), "hit logged while no run files are open");

        self.counters.hit_count += u64::from(batch.count);
        self.hit_list
            .extend(std::iter::repeat(batch.position).take(batch.count as usize));

        if let Some(files) = self.files.as_mut() {
            if let Err(e) = files.log_hit(&batch) {
                error!(error = %e, "Failed to write hit log");
            }
        }

        debug!(
            count = batch.count,
            hw_ts = batch.hw_timestamp_us,
            x = batch.position.x,
            y = batch.position.y,
            total = self.counters.hit_count,
            "Hits logged"
        );
    }

    fn handle_scan_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::StepStarted {
                index,
                total,
                point,
            } => {
                info!(
                    x = point.x,
                    y = point.y,
                    "Scan advancing to point {} / {}",
                    index + 1,
                    total
                );
            }
            ScanEvent::StepTimedOut => {
                self.counters.timeout_counter += 1;
            }
            ScanEvent::PointDone => {
                self.counters.scan_points_done += 1;
            }
            ScanEvent::LatchUp {
                number,
                hit_count,
                point,
                samples,
            } => {
                self.counters.latch_counter += 1;
                debug_assert_eq!(number, self.counters.latch_counter, "latch-up numbering drifted");
                let key = WaveformTable::key(hit_count, point);
                warn!(
                    latch_counter = self.counters.latch_counter,
                    hit_count,
                    key = %key,
                    samples = samples.len(),
                    "LATCH-UP logged"
                );
                self.waveforms.insert(key, samples);
            }
            ScanEvent::AxesSwapped => {
                if let Some(files) = &self.files {
                    if let Err(e) = files.mark_axis_swap() {
                        warn!(error = %e, "Failed to write axis swap marker");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Run end
    // ------------------------------------------------------------------------

    /// Closes the run after its scan task returned.
    async fn finish_run(&mut self, result: Result<ScanOutcome, JoinError>) {
        // everything the scan and the pump produced belongs to this run
        while let Ok(event) = self.scan_events.try_recv() {
            self.handle_scan_event(event);
        }
        while let Ok(batch) = self.hits.try_recv() {
            self.handle_hits(batch);
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Scan task failed");
                self.force_safe_state().await;
                ScanOutcome::Aborted(AbortReason::Hardware(e.to_string()))
            }
        };
        match &outcome {
            ScanOutcome::Completed => info!("Scan completed"),
            ScanOutcome::Aborted(reason) => warn!(?reason, "Scan aborted"),
        }

        info!(
            "Scan finished, {} / {} points done.",
            self.counters.scan_points_done, self.counters.scan_points
        );
        info!(
            "Final hit count: {}, timeouts reached: {}",
            self.counters.hit_count, self.counters.timeout_counter
        );

        if let Some(files) = self.files.take() {
            if self.settings.latch.is_some() {
                info!(latch_counter = self.counters.latch_counter, "Latch-up counter");
                if let Err(e) = files.write_waveforms(&self.waveforms) {
                    error!(error = %e, "Failed to save latch-up waveforms");
                }
            }
            if let Err(e) = files.finish() {
                error!(error = %e, "Failed to close hit log");
            }
        }

        info!(run_id = ?self.run_id, "Run ended");
        self.run_log.detach();
        self.state = RunState::Idle;
        debug_assert!(
            self.scan.is_none() && self.files.is_none(),
            "run state left behind after the run ended"
        );

        for respond_to in self.pending_stops.drain(..) {
            let _ = respond_to.send(Ok(()));
        }
    }

    /// Shutter closed, beam at origin, program disarmed.
    async fn force_safe_state(&self) {
        self.pump.halt().await;
        if let Err(e) = self.backend.close_shutter().await {
            error!(error = %e, "Failed to close shutter");
        }
        if let Err(e) = self.backend.set_position(DacPoint::ORIGIN).await {
            error!(error = %e, "Failed to move beam to origin");
        }
        if let Err(e) = self.backend.disarm().await {
            warn!(error = %e, "Failed to disarm trigger backend");
        }
    }
}

fn storage_error(e: StorageError) -> ControlError {
    error!(error = %e, "Run storage failure");
    ControlError::Storage(e.to_string())
}

/// Resolves when the active scan task returns; pending without one.
async fn join_scan(scan: &mut Option<ActiveScan>) -> Result<ScanOutcome, JoinError> {
    match scan {
        Some(active) => (&mut active.handle).await,
        None => std::future::pending().await,
    }
}

//! Experiment engine: the state machine that runs one experiment at a time.
//!
//! The engine owns the lifecycle of the single active run:
//!
//! ```text
//! start(spec) ─> Preparing ─> Running ─> Completing ─┐
//!                    │           │                   ├─> Idle
//!                    │           └────> Aborting ────┘
//!                    └─ arm refused / upload failed ──> Idle
//! ```
//!
//! Preparation happens on the caller's task so preparation errors come back from
//! [`ExperimentEngine::start`] directly. Once the executor accepted the table, a coordination task
//! takes over: it polls the executor at a bounded interval, watches for device faults and abort
//! requests, and runs the post-experiment hook. Mid-run failures never escape as errors; they
//! end up in the [`RunResult`] after outputs are idle and devices are disarmed.

use super::builder::{ActionTableBuilder, BuiltExperiment};
use super::compiler::{LineMap, TimingCompiler};
use super::executor::{ExecutorClient, ExecutorPhase, TableHandle};
use super::spec::ExperimentSpec;
use super::state::{ExperimentState, RunRecord, StateTransition};
use crate::config::ScopeConfig;
use crate::data::frame::PlaneMetadata;
use crate::data::intake::{DataIntake, IntakeFinish, IntakeReport};
use crate::data::writer::{RawStackWriter, RunHeader};
use crate::error::{AppResult, DaqError, MissingFrameWarning};
use crate::events::{DeviceFault, StateChanged};
use crate::hardware::capabilities::Camera;
use crate::hardware::registry::{DeviceId, DeviceRegistry};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every pass played
    Completed,
    /// Stopped on request
    Aborted,
    /// Stopped by a fault or a lost executor connection
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a run, handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Run identifier
    pub run_id: String,
    /// How the run ended
    pub status: RunStatus,
    /// Number of slots whose frame never arrived
    pub missing_frame_count: usize,
    /// The missing slots
    pub missing_frames: Vec<MissingFrameWarning>,
    /// Per-slot metadata in acquisition order
    pub planes: Vec<PlaneMetadata>,
    /// Pixel data file
    pub output_path: Option<PathBuf>,
    /// Plane metadata file
    pub metadata_path: Option<PathBuf>,
    /// Table entries executed over all passes
    pub completed_index: u64,
    /// Table entries over all passes
    pub total_entries: u64,
    /// Why the run did not complete, or what went wrong during cleanup
    pub error: Option<String>,
    /// Every participating light source reported it is not emitting after cleanup
    pub lights_idle: bool,
    /// Devices force-disconnected because they did not acknowledge disarm in time
    pub unrecoverable_devices: Vec<DeviceId>,
    /// Frames that arrived after their slot was closed
    pub late_frames: u64,
}

impl RunResult {
    /// Result with no acquisition data.
    pub fn empty(run_id: &str, status: RunStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            status,
            missing_frame_count: 0,
            missing_frames: Vec::new(),
            planes: Vec::new(),
            output_path: None,
            metadata_path: None,
            completed_index: 0,
            total_entries: 0,
            error: None,
            lights_idle: true,
            unrecoverable_devices: Vec::new(),
            late_frames: 0,
        }
    }

    fn absorb(&mut self, report: IntakeReport) {
        self.missing_frame_count = report.missing_count();
        self.missing_frames = report.missing;
        self.planes = report.planes;
        self.late_frames = report.late_frames;
        if let Some(writer) = report.writer {
            self.output_path = Some(writer.data_path);
            self.metadata_path = Some(writer.metadata_path);
        }
        if let Some(e) = report.storage_error {
            self.note_error(format!("storage: {}", e));
        }
    }

    fn note_error(&mut self, message: String) {
        match &mut self.error {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(&message);
            }
            None => self.error = Some(message),
        }
    }
}

/// Engine status snapshot.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Current state
    pub state: ExperimentState,
    /// Active run (None when idle)
    pub run_id: Option<String>,
    /// Table entries executed so far
    pub completed_index: u64,
    /// Table entries over all passes
    pub total_entries: u64,
    /// Error of the last run, if any
    pub last_error: Option<String>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: ExperimentState::Idle,
            run_id: None,
            completed_index: 0,
            total_entries: 0,
            last_error: None,
        }
    }
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    task: JoinHandle<RunResult>,
}

impl RunHandle {
    /// Run identifier
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Wait for the run to return to `Idle` and take its result.
    pub async fn wait(self) -> AppResult<RunResult> {
        self.task
            .await
            .map_err(|e| DaqError::Executor(format!("coordination task failed: {}", e)))
    }
}

struct EngineInner {
    registry: Arc<DeviceRegistry>,
    config: ScopeConfig,
    status: Mutex<EngineStatus>,
    history: Mutex<Vec<StateTransition>>,
    abort: Mutex<Option<Arc<Notify>>>,
    state_tx: watch::Sender<ExperimentState>,
}

impl EngineInner {
    /// Record a state change. The caller holds the status lock, so history, watchers and
    /// subscribers see changes in the order they were made.
    fn enter(&self, status: &mut EngineStatus, to: ExperimentState) {
        let from = status.state;
        if !from.can_transition_to(to) {
            warn!(%from, %to, "Unexpected state transition");
        }
        status.state = to;
        self.history.lock().push(StateTransition {
            from,
            to,
            at: Utc::now(),
        });
        info!(%from, %to, "State transition");
        self.state_tx.send_replace(to);
        self.registry.events().state_changed(StateChanged {
            run_id: status.run_id.clone(),
            from,
            to,
        });
    }

    fn transition(&self, to: ExperimentState) {
        let mut status = self.status.lock();
        self.enter(&mut status, to);
    }

    /// Return to `Idle` and release the run's id and abort handle in one step.
    fn finish_run(&self, error: Option<String>) {
        let mut status = self.status.lock();
        status.last_error = error;
        self.enter(&mut status, ExperimentState::Idle);
        status.run_id = None;
        *self.abort.lock() = None;
    }
}

/// Holds the `Preparing` claim of [`ExperimentEngine::start`].
///
/// If the start future is dropped (or unwinds) before the run reaches `Running`, the devices
/// armed so far are disarmed and the engine returns to `Idle`.
struct PreparationGuard {
    engine: ExperimentEngine,
    armed: Vec<DeviceId>,
    pending: bool,
}

impl PreparationGuard {
    fn new(engine: &ExperimentEngine) -> Self {
        Self {
            engine: engine.clone(),
            armed: Vec::new(),
            pending: true,
        }
    }

    /// Preparation ended; the caller has already moved the engine on.
    fn release(mut self) {
        self.pending = false;
    }
}

impl Drop for PreparationGuard {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        let reason = "preparation interrupted".to_string();
        warn!(devices = self.armed.len(), "Preparation interrupted before the run started");
        let armed = std::mem::take(&mut self.armed);
        let engine = self.engine.clone();
        match tokio::runtime::Handle::try_current() {
            // the engine stays busy until the hardware is released
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(executor) = engine.inner.registry.executor() {
                        if let Err(e) = executor.set_idle().await {
                            warn!("Executor outputs not confirmed idle: {:#}", e);
                        }
                    }
                    for camera in engine.cameras(&armed) {
                        camera.detach_frame_sink();
                    }
                    engine.disarm_all(&armed).await;
                    engine.inner.finish_run(Some(reason));
                });
            }
            Err(_) => self.engine.inner.finish_run(Some(reason)),
        }
    }
}

/// Everything a running experiment holds between preparation and cleanup.
struct ActiveRun {
    run_id: String,
    spec: ExperimentSpec,
    started_at: DateTime<Utc>,
    built: BuiltExperiment,
    client: ExecutorClient,
    handle: TableHandle,
    intake: Option<DataIntake>,
    stage_origin: Option<f64>,
}

enum Outcome {
    Completed,
    UserAbort,
    Fault(String),
    ConnectionLost(String),
}

/// Runs experiments against the devices of one registry, one at a time.
///
/// Cloning shares the engine.
#[derive(Clone)]
pub struct ExperimentEngine {
    inner: Arc<EngineInner>,
}

impl ExperimentEngine {
    /// Create an idle engine.
    pub fn new(registry: Arc<DeviceRegistry>, config: ScopeConfig) -> Self {
        let (state_tx, _) = watch::channel(ExperimentState::Idle);
        Self {
            inner: Arc::new(EngineInner {
                registry,
                config,
                status: Mutex::new(EngineStatus::default()),
                history: Mutex::new(Vec::new()),
                abort: Mutex::new(None),
                state_tx,
            }),
        }
    }

    /// Status snapshot
    pub fn status(&self) -> EngineStatus {
        self.inner.status.lock().clone()
    }

    /// Current state
    pub fn state(&self) -> ExperimentState {
        self.inner.status.lock().state
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ExperimentState> {
        self.inner.state_tx.subscribe()
    }

    /// Device registry the engine drives
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// Build the action table for `spec` without touching hardware.
    pub fn plan(&self, spec: &ExperimentSpec) -> AppResult<BuiltExperiment> {
        let compiler = self.compiler();
        let built = ActionTableBuilder::new(&self.inner.registry)
            .with_min_separation(compiler.tick_period())
            .build(spec)?;
        compiler.compile(&built.table)?;
        Ok(built)
    }

    /// Request an abort of the active run.
    ///
    /// Returns `false` when there is nothing to abort. Repeated requests are harmless.
    pub fn abort(&self) -> bool {
        let state = self.state();
        if !state.can_abort() {
            info!(%state, "Abort ignored: no run to abort");
            return false;
        }
        match self.inner.abort.lock().as_ref() {
            Some(notify) => {
                warn!("Abort requested");
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Start a run.
    ///
    /// Builds the table, arms every participating device, uploads and starts playback, then
    /// returns while the run continues on a coordination task.
    ///
    /// # Errors
    /// - `Busy` if another run is not yet back to `Idle`
    /// - `InvalidSpec` if the experiment spec cannot be executed (no device touched)
    /// - `Compile` if the table cannot be played on this executor (no device armed)
    /// - `Preparation` if a device refused to arm (the engine returns to `Idle`)
    /// - `Executor`, `Storage` for upload and output failures (the engine returns to `Idle`)
    ///
    /// Dropping the returned future before it resolves releases the devices armed so far and
    /// returns the engine to `Idle`.
    pub async fn start(&self, spec: ExperimentSpec) -> AppResult<RunHandle> {
        let run_id = Uuid::new_v4().to_string();
        let notify = Arc::new(Notify::new());
        {
            let mut status = self.inner.status.lock();
            if !status.state.can_start() {
                return Err(DaqError::Busy {
                    state: status.state,
                });
            }
            // claim the engine before releasing the lock
            status.run_id = Some(run_id.clone());
            status.completed_index = 0;
            status.total_entries = 0;
            status.last_error = None;
            self.inner.history.lock().clear();
            self.inner.enter(&mut status, ExperimentState::Preparing);
            *self.inner.abort.lock() = Some(notify.clone());
        }
        let mut guard = PreparationGuard::new(self);

        let span = info_span!("experiment", run_id = %run_id);
        info!(parent: &span, experiment = %spec.name, "Starting experiment");

        // faults published from here on reach the coordination task
        let faults = self.inner.registry.events().subscribe_faults();

        let run = match self
            .prepare(run_id.clone(), spec, &mut guard)
            .instrument(span.clone())
            .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(parent: &span, "Preparation failed: {}", e);
                guard.release();
                self.inner.finish_run(Some(e.to_string()));
                return Err(e);
            }
        };

        {
            let mut status = self.inner.status.lock();
            status.total_entries = run.built.table.total_entries();
            self.inner.enter(&mut status, ExperimentState::Running);
        }
        guard.release();

        let engine = self.clone();
        let task = tokio::spawn(engine.supervise(run, notify, faults).instrument(span));
        Ok(RunHandle { run_id, task })
    }

    fn compiler(&self) -> TimingCompiler {
        TimingCompiler::new(
            &self.inner.config.executor,
            LineMap::from_registry(&self.inner.registry),
        )
    }

    async fn prepare(
        &self,
        run_id: String,
        spec: ExperimentSpec,
        guard: &mut PreparationGuard,
    ) -> AppResult<ActiveRun> {
        let registry = &self.inner.registry;
        let config = &self.inner.config;
        let started_at = Utc::now();

        let executor = registry
            .executor()
            .ok_or_else(|| DaqError::Configuration("no timing executor configured".to_string()))?;
        let compiler = self.compiler();

        // reject an unusable spec before any device is queried
        let mut built = ActionTableBuilder::new(registry)
            .with_min_separation(compiler.tick_period())
            .build(&spec)?;

        let mut stage_origin = None;
        if let Some(stage_id) = built.stage.clone() {
            if let Some(stage) = registry.get_stage(&stage_id) {
                let origin = stage.position().await.map_err(|e| DaqError::Preparation {
                    device: stage_id.clone(),
                    reason: format!("position unavailable: {:#}", e),
                })?;
                built = ActionTableBuilder::new(registry)
                    .with_min_separation(compiler.tick_period())
                    .with_stage_origin(origin)
                    .build(&spec)?;
                stage_origin = Some(origin);
            }
        }
        info!(
            entries = built.table.len(),
            slots = built.acquisition.len(),
            passes = built.table.repeat_count(),
            duration = ?built.table.total_duration(),
            "Action table built"
        );

        let profile = compiler.compile(&built.table)?;

        guard.armed = built.participants.clone();
        self.arm_all(&built.participants).await?;

        let data_path = spec.save_path.clone().unwrap_or_else(|| {
            config
                .storage
                .output_dir
                .join(format!("{}_{}.raw", spec.name, run_id))
        });
        let writer = match RawStackWriter::create(&data_path, config.storage.write_queue) {
            Ok(writer) => writer,
            Err(e) => {
                self.disarm_all(&built.participants).await;
                return Err(e);
            }
        };

        let frame_size = built
            .acquisition
            .first()
            .and_then(|s| registry.get_camera(&s.key.camera))
            .map(|c| c.resolution());
        let intake = DataIntake::spawn(
            &run_id,
            built.all_slots(),
            Box::new(writer),
            RunHeader {
                run_id: run_id.clone(),
                experiment: spec.name.clone(),
                started_at,
                frame_size,
            },
            &config.intake,
            registry.events().clone(),
        );
        for camera in self.cameras(&built.participants) {
            camera.attach_frame_sink(intake.sink());
        }

        let mut client = ExecutorClient::new(executor, compiler);
        let table = Arc::new(built.table.clone());
        let started = async {
            let handle = client.upload_compiled(table, profile).await?;
            client.start(handle).await?;
            Ok::<_, DaqError>(handle)
        }
        .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                let idle = client.force_idle().await;
                if let Err(idle_err) = &idle {
                    warn!("Executor outputs not confirmed idle after failed start: {}", idle_err);
                }
                for camera in self.cameras(&built.participants) {
                    camera.detach_frame_sink();
                }
                self.disarm_all(&built.participants).await;
                if let Err(intake_err) = intake.finish(IntakeFinish::Aborted).await {
                    warn!("Intake did not shut down cleanly: {}", intake_err);
                }
                return Err(match idle {
                    Ok(()) => e,
                    Err(idle_err) => e.with_context(format!("outputs not confirmed idle: {}", idle_err)),
                });
            }
        };
        intake.mark_started(Instant::now());

        Ok(ActiveRun {
            run_id,
            spec,
            started_at,
            built,
            client,
            handle,
            intake: Some(intake),
            stage_origin,
        })
    }

    /// Arm devices in order; on the first refusal disarm the ones already armed.
    async fn arm_all(&self, participants: &[DeviceId]) -> AppResult<()> {
        let arm_timeout = self.inner.config.engine.arm_timeout;
        let mut armed: Vec<DeviceId> = Vec::new();
        for id in participants {
            let Some(device) = self.inner.registry.get_armable(id) else {
                continue;
            };
            let reason = match timeout(arm_timeout, device.arm()).await {
                Ok(Ok(())) => {
                    armed.push(id.clone());
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("no acknowledgement within {:?}", arm_timeout),
            };
            warn!(device = %id, %reason, "Device refused to arm");
            self.disarm_all(&armed).await;
            return Err(DaqError::Preparation {
                device: id.clone(),
                reason,
            });
        }
        info!(devices = armed.len(), "All devices armed");
        Ok(())
    }

    /// Disarm devices concurrently, each within the grace period.
    ///
    /// Devices that do not acknowledge in time are force-disconnected and returned.
    async fn disarm_all(&self, participants: &[DeviceId]) -> Vec<DeviceId> {
        let grace = self.inner.config.engine.abort_grace;
        let registry = &self.inner.registry;
        let disarms = participants.iter().filter_map(|id| {
            registry.get_armable(id).map(|device| async move {
                let failure = match timeout(grace, device.disarm()).await {
                    Ok(Ok(())) => return None,
                    Ok(Err(e)) => format!("disarm failed: {:#}", e),
                    Err(_) => format!("no disarm acknowledgement within {:?}", grace),
                };
                device.force_disconnect();
                error!(device = %id, %failure, "Device force-disconnected");
                registry.events().device_fault(DeviceFault {
                    device: id.clone(),
                    message: failure,
                    unrecoverable: true,
                });
                Some(id.clone())
            })
        });
        join_all(disarms).await.into_iter().flatten().collect()
    }

    fn cameras(&self, participants: &[DeviceId]) -> Vec<Arc<dyn Camera>> {
        participants
            .iter()
            .filter_map(|id| self.inner.registry.get_camera(id))
            .collect()
    }

    async fn supervise(
        self,
        mut run: ActiveRun,
        abort: Arc<Notify>,
        mut faults: broadcast::Receiver<DeviceFault>,
    ) -> RunResult {
        let poll_interval = self.inner.config.engine.poll_interval;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = abort.notified() => break Outcome::UserAbort,
                fault = faults.recv() => match fault {
                    Ok(fault) if run.built.participants.contains(&fault.device) => {
                        break Outcome::Fault(format!("{}: {}", fault.device, fault.message));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        break Outcome::Fault(format!("{} device fault event(s) missed", missed));
                    }
                    Err(broadcast::error::RecvError::Closed) => continue,
                },
                _ = ticker.tick() => {}
            }

            match run.client.poll_status(run.handle).await {
                Ok(status) => {
                    self.inner.status.lock().completed_index = status.completed_index;
                    match status.phase {
                        ExecutorPhase::Completed => break Outcome::Completed,
                        ExecutorPhase::Aborted => {
                            break Outcome::Fault(
                                status.error.unwrap_or_else(|| "executor stopped".to_string()),
                            )
                        }
                        _ => {
                            if let Some(fault) = status.error {
                                break Outcome::Fault(fault);
                            }
                        }
                    }
                }
                Err(DaqError::ConnectionLost(reason)) => break Outcome::ConnectionLost(reason),
                Err(e) => break Outcome::Fault(e.to_string()),
            }
        };

        let (status, finish, reason) = match outcome {
            Outcome::Completed => (RunStatus::Completed, IntakeFinish::Completed, None),
            Outcome::UserAbort => (
                RunStatus::Aborted,
                IntakeFinish::Aborted,
                Some("aborted by user".to_string()),
            ),
            Outcome::Fault(reason) => (RunStatus::Failed, IntakeFinish::Aborted, Some(reason)),
            Outcome::ConnectionLost(reason) => (
                RunStatus::Failed,
                IntakeFinish::Aborted,
                Some(DaqError::ConnectionLost(reason).to_string()),
            ),
        };

        if status == RunStatus::Completed {
            self.inner.transition(ExperimentState::Completing);
        } else {
            warn!(reason = reason.as_deref().unwrap_or(""), "Run stopping early");
            self.inner.transition(ExperimentState::Aborting);
        }

        let mut result = RunResult::empty(&run.run_id, status);
        result.total_entries = run.built.table.total_entries();
        if let Some(reason) = reason {
            result.note_error(reason);
        }

        self.post_experiment(&mut run, finish, &mut result).await;

        if self.inner.config.engine.archive_runs {
            self.archive(&run, &result);
        }

        info!(
            status = %result.status,
            missing = result.missing_frame_count,
            planes = result.planes.len(),
            "Run finished"
        );
        self.inner.finish_run(result.error.clone());
        result
    }

    /// Post-experiment hook: idle outputs, disarm, detach, flush, restore the stage.
    async fn post_experiment(&self, run: &mut ActiveRun, finish: IntakeFinish, result: &mut RunResult) {
        let registry = &self.inner.registry;
        let participants = run.built.participants.clone();

        if finish == IntakeFinish::Aborted {
            if let Err(e) = run.client.force_idle().await {
                warn!("Executor outputs not confirmed idle: {}", e);
                result.note_error(format!("idle: {}", e));
            }
        }
        if let Ok(status) = run.client.poll_status(run.handle).await {
            result.completed_index = status.completed_index;
        } else {
            result.completed_index = self.inner.status.lock().completed_index;
        }

        result.unrecoverable_devices = self.disarm_all(&participants).await;

        let mut lights_idle = true;
        for id in &participants {
            if let Some(light) = registry.get_light(id) {
                match light.is_emitting().await {
                    Ok(false) => {}
                    Ok(true) => {
                        error!(device = %id, "Light still emitting after cleanup");
                        lights_idle = false;
                    }
                    Err(e) if result.unrecoverable_devices.contains(id) => {
                        warn!(device = %id, "Light state unknown after disconnect: {:#}", e);
                    }
                    Err(e) => {
                        error!(device = %id, "Light state unknown: {:#}", e);
                        lights_idle = false;
                    }
                }
            }
        }
        result.lights_idle = lights_idle;

        for camera in self.cameras(&participants) {
            camera.detach_frame_sink();
        }

        if let Some(intake) = run.intake.take() {
            match intake.finish(finish).await {
                Ok(report) => {
                    if report.missing_count() > 0 {
                        warn!(missing = report.missing_count(), "Run finished with missing frames");
                    }
                    result.absorb(report);
                }
                Err(e) => result.note_error(e.to_string()),
            }
        }

        if let (Some(stage_id), Some(origin)) = (&run.built.stage, run.stage_origin) {
            if result.unrecoverable_devices.contains(stage_id) {
                warn!(device = %stage_id, "Stage not restored: disconnected");
            } else if let Some(stage) = registry.get_stage(stage_id) {
                let grace = self.inner.config.engine.abort_grace
                    + stage.movement_time(origin, origin).total();
                match timeout(grace, stage.move_abs(origin)).await {
                    Ok(Ok(())) => info!(device = %stage_id, position = origin, "Stage restored"),
                    Ok(Err(e)) => warn!(device = %stage_id, "Stage restore failed: {:#}", e),
                    Err(_) => warn!(device = %stage_id, "Stage restore timed out"),
                }
            }
        }
    }

    fn archive(&self, run: &ActiveRun, result: &RunResult) {
        let record = RunRecord {
            run_id: run.run_id.clone(),
            started_at: run.started_at,
            finished_at: Utc::now(),
            spec: run.spec.clone(),
            history: self.inner.history.lock().clone(),
            result: result.clone(),
        };
        let path = RunRecord::default_path(&self.inner.config.storage.output_dir, &run.run_id);
        match record.save(&path) {
            Ok(()) => info!(path = %path.display(), "Run archived"),
            Err(e) => warn!("Failed to archive run: {:#}", e),
        }
    }
}

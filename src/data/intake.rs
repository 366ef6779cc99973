//! Data intake: receives frames from camera adapters and commits them in acquisition order.
//!
//! Camera adapters push frames through a [`FrameSink`] from their own tasks. The sink only
//! enqueues (`try_send`), so an adapter's I/O path is never blocked by the intake. A single
//! intake task owns the queue, matches each frame to its slot by `(camera, frame_index)`,
//! buffers frames that arrive ahead of earlier slots, and hands planes to the [`PlaneWriter`]
//! strictly in the order of the acquisition plan.
//!
//! A slot whose frame has not arrived by `expected_at + exposure + frame_timeout` (measured from
//! the moment playback started) is marked missing and the cursor moves on, so one stalled camera
//! never holds up the rest of the run.

use crate::config::IntakeConfig;
use crate::data::frame::{AcquisitionSlot, ImageFrame, PlaneMetadata, PlaneStatus};
use crate::data::writer::{PlaneWriter, RunHeader, WriterSummary};
use crate::error::{AppResult, DaqError, MissingFrameWarning};
use crate::events::{EventBus, FrameArrived};
use crate::hardware::registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// Frame sink
// =============================================================================

/// Handle camera adapters use to deliver frames.
///
/// Cloneable; every clone feeds the same intake queue.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<ImageFrame>,
    rejected: Arc<AtomicU64>,
}

impl FrameSink {
    /// Wrap the sending half of an intake queue.
    ///
    /// ```
    /// use rust_scope::data::frame::ImageFrame;
    /// use rust_scope::data::intake::FrameSink;
    /// use tokio::sync::mpsc;
    ///
    /// # tokio_test::block_on(async {
    /// let (tx, mut rx) = mpsc::channel(4);
    /// let sink = FrameSink::new(tx);
    /// assert!(sink.on_frame_arrived(ImageFrame::new("cam_a", 0, 1, 1, vec![7])));
    /// assert_eq!(rx.recv().await.unwrap().frame_index, 0);
    /// # });
    /// ```
    pub fn new(tx: mpsc::Sender<ImageFrame>) -> Self {
        Self {
            tx,
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a frame and return immediately.
    ///
    /// Returns `false` if the frame was dropped because the queue is full or the intake has
    /// shut down. The slot is then reported missing once its timeout expires.
    pub fn on_frame_arrived(&self, frame: ImageFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                let frame = match e {
                    mpsc::error::TrySendError::Full(f) | mpsc::error::TrySendError::Closed(f) => f,
                };
                warn!(
                    camera = %frame.camera_id,
                    frame_index = frame.frame_index,
                    "Frame dropped: intake queue unavailable"
                );
                false
            }
        }
    }

    /// Number of frames this sink (and its clones) could not enqueue
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Intake
// =============================================================================

/// How the run ended, as seen by the intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeFinish {
    /// Every trigger fired; wait for outstanding frames up to their timeouts.
    Completed,
    /// Playback stopped early; slots scheduled after the stop are never acquired.
    Aborted,
}

/// What the intake committed over the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeReport {
    /// One entry per slot, in acquisition order
    pub planes: Vec<PlaneMetadata>,
    /// Slots whose frame never arrived
    pub missing: Vec<MissingFrameWarning>,
    /// Frames matched to a slot
    pub frames_received: u64,
    /// Frames that arrived after their slot had been given up on
    pub late_frames: u64,
    /// Frames that matched no slot, or a slot already filled
    pub unexpected_frames: u64,
    /// Frames the sink could not enqueue
    pub rejected_frames: u64,
    /// Writer output, if the writer shut down cleanly
    pub writer: Option<WriterSummary>,
    /// Writer failure, if any
    pub storage_error: Option<String>,
}

impl IntakeReport {
    /// Number of missing slots
    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    /// Slots the run stopped before triggering
    pub fn not_acquired_count(&self) -> usize {
        self.planes
            .iter()
            .filter(|p| p.status == PlaneStatus::NotAcquired)
            .count()
    }
}

enum Control {
    Started(Instant),
    Finish(IntakeFinish),
}

/// Running intake for one experiment run.
pub struct DataIntake {
    sink: FrameSink,
    control: mpsc::Sender<Control>,
    task: JoinHandle<IntakeReport>,
}

impl DataIntake {
    /// Spawn the intake task for `slots`, which must be in acquisition order.
    pub fn spawn(
        run_id: &str,
        slots: Vec<AcquisitionSlot>,
        mut writer: Box<dyn PlaneWriter>,
        header: RunHeader,
        config: &IntakeConfig,
        events: EventBus,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(4);
        let sink = FrameSink::new(frame_tx);

        let mut state = IntakeState::new(run_id.to_string(), slots, config.frame_timeout, events);
        if let Err(e) = writer.set_metadata(header) {
            error!("Plane writer rejected run metadata: {}", e);
            state.storage_error = Some(e.to_string());
        }
        state.writer = Some(writer);

        let check_every = (config.frame_timeout / 4)
            .clamp(Duration::from_millis(1), Duration::from_millis(50));
        let span = info_span!("intake", run_id = %run_id);
        let task = tokio::spawn(
            intake_loop(state, frame_rx, control_rx, sink.clone(), check_every).instrument(span),
        );

        Self {
            sink,
            control: control_tx,
            task,
        }
    }

    /// Sink to attach to camera adapters
    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Tell the intake when playback started. Slot deadlines are measured from `at`.
    pub fn mark_started(&self, at: Instant) {
        if self.control.try_send(Control::Started(at)).is_err() {
            warn!("Intake task not accepting control messages");
        }
    }

    /// End the run and wait for the intake to flush every slot.
    pub async fn finish(self, how: IntakeFinish) -> AppResult<IntakeReport> {
        if self.control.send(Control::Finish(how)).await.is_err() {
            warn!("Intake task exited before finish");
        }
        drop(self.control);
        self.task
            .await
            .map_err(|e| DaqError::Storage(format!("intake task failed: {}", e)))
    }
}

async fn intake_loop(
    mut state: IntakeState,
    mut frames: mpsc::Receiver<ImageFrame>,
    mut control: mpsc::Receiver<Control>,
    sink: FrameSink,
    check_every: Duration,
) -> IntakeReport {
    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(slots = state.slots.len(), "Data intake running");

    loop {
        tokio::select! {
            Some(frame) = frames.recv() => state.accept(frame),
            Some(ctrl) = control.recv() => match ctrl {
                Control::Started(at) => state.origin = Some(at),
                Control::Finish(how) => {
                    if how == IntakeFinish::Aborted || state.origin.is_none() {
                        state.drop_untriggered(Instant::now());
                    }
                    state.finishing = Some(how);
                }
            },
            _ = ticker.tick() => {}
        }

        // frames already queued take precedence over timeouts
        while let Ok(frame) = frames.try_recv() {
            state.accept(frame);
        }
        state.expire(Instant::now());
        state.commit_ready();

        if state.done() {
            break;
        }
    }

    let rejected = sink.rejected();
    state.into_report(rejected).await
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Filled(ImageFrame),
    Missing,
    NotAcquired,
    Committed(PlaneStatus),
}

struct IntakeState {
    run_id: String,
    slots: Vec<AcquisitionSlot>,
    states: Vec<SlotState>,
    by_frame: HashMap<(DeviceId, u64), usize>,
    cursor: usize,
    origin: Option<Instant>,
    frame_timeout: Duration,
    finishing: Option<IntakeFinish>,
    writer: Option<Box<dyn PlaneWriter>>,
    events: EventBus,
    planes: Vec<PlaneMetadata>,
    missing: Vec<MissingFrameWarning>,
    frames_received: u64,
    late_frames: u64,
    unexpected_frames: u64,
    storage_error: Option<String>,
}

impl IntakeState {
    fn new(
        run_id: String,
        slots: Vec<AcquisitionSlot>,
        frame_timeout: Duration,
        events: EventBus,
    ) -> Self {
        let by_frame = slots
            .iter()
            .enumerate()
            .map(|(i, s)| ((s.key.camera.clone(), s.camera_frame_index), i))
            .collect();
        let states = slots.iter().map(|_| SlotState::Pending).collect();
        Self {
            run_id,
            slots,
            states,
            by_frame,
            cursor: 0,
            origin: None,
            frame_timeout,
            finishing: None,
            writer: None,
            events,
            planes: Vec::new(),
            missing: Vec::new(),
            frames_received: 0,
            late_frames: 0,
            unexpected_frames: 0,
            storage_error: None,
        }
    }

    fn accept(&mut self, frame: ImageFrame) {
        let key = (frame.camera_id.clone(), frame.frame_index);
        let Some(&index) = self.by_frame.get(&key) else {
            self.unexpected_frames += 1;
            warn!(
                camera = %frame.camera_id,
                frame_index = frame.frame_index,
                "Frame matches no acquisition slot"
            );
            return;
        };

        let slot = self.slots[index].key.clone();
        match &self.states[index] {
            SlotState::Pending => {
                self.frames_received += 1;
                debug!(slot = %slot, "Frame buffered");
                self.states[index] = SlotState::Filled(frame);
            }
            SlotState::Missing
            | SlotState::NotAcquired
            | SlotState::Committed(PlaneStatus::Missing)
            | SlotState::Committed(PlaneStatus::NotAcquired) => {
                self.late_frames += 1;
                warn!(slot = %slot, "Frame arrived after its slot was closed");
            }
            SlotState::Filled(_) | SlotState::Committed(PlaneStatus::Written) => {
                self.unexpected_frames += 1;
                warn!(slot = %slot, "Duplicate frame for slot");
            }
        }
    }

    /// Mark slots whose deadline has passed as missing.
    fn expire(&mut self, now: Instant) {
        let Some(origin) = self.origin else {
            return;
        };
        for index in self.cursor..self.slots.len() {
            let slot = &self.slots[index];
            if origin + slot.expected_at > now {
                // plan order is trigger order
                break;
            }
            if !matches!(self.states[index], SlotState::Pending) {
                continue;
            }
            if origin + slot.expected_at + slot.exposure + self.frame_timeout > now {
                continue;
            }
            warn!(slot = %slot.key, "Frame not received within timeout, marking slot missing");
            self.missing.push(MissingFrameWarning {
                slot: slot.key.clone(),
                expected_at: slot.expected_at,
            });
            self.states[index] = SlotState::Missing;
        }
    }

    /// Close every pending slot the run stopped before triggering.
    fn drop_untriggered(&mut self, now: Instant) {
        let elapsed = self.origin.map(|origin| now.saturating_duration_since(origin));
        for index in self.cursor..self.slots.len() {
            let triggered = elapsed.is_some_and(|e| self.slots[index].expected_at <= e);
            if matches!(self.states[index], SlotState::Pending) && !triggered {
                self.states[index] = SlotState::NotAcquired;
            }
        }
    }

    fn commit_ready(&mut self) {
        while self.cursor < self.slots.len() {
            let index = self.cursor;
            let (plane, pixels) = match std::mem::replace(&mut self.states[index], SlotState::Pending) {
                SlotState::Filled(frame) => {
                    let slot = &self.slots[index];
                    self.events.frame_arrived(FrameArrived {
                        run_id: self.run_id.clone(),
                        slot: slot.key.clone(),
                        elapsed: frame.metadata.timestamp,
                    });
                    (PlaneMetadata::written(slot, &frame), Some(frame.pixels))
                }
                SlotState::Missing => (
                    PlaneMetadata::pending(&self.slots[index], PlaneStatus::Missing),
                    None,
                ),
                SlotState::NotAcquired => (
                    PlaneMetadata::pending(&self.slots[index], PlaneStatus::NotAcquired),
                    None,
                ),
                other => {
                    self.states[index] = other;
                    break;
                }
            };
            self.states[index] = SlotState::Committed(plane.status);
            self.write(plane, pixels);
            self.cursor += 1;
        }
    }

    fn write(&mut self, mut plane: PlaneMetadata, pixels: Option<Vec<u16>>) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write(plane.clone(), pixels) {
                // the writer kept the slot without pixels
                if plane.status == PlaneStatus::Written {
                    plane.status = PlaneStatus::Missing;
                }
                if self.storage_error.is_none() {
                    error!("Plane writer failed: {}", e);
                    self.storage_error = Some(e.to_string());
                }
            }
        }
        self.planes.push(plane);
    }

    fn done(&self) -> bool {
        self.finishing.is_some() && self.cursor == self.slots.len()
    }

    async fn into_report(mut self, rejected_frames: u64) -> IntakeReport {
        let mut writer_summary = None;
        if let Some(writer) = self.writer.take() {
            match tokio::task::spawn_blocking(move || writer.shutdown()).await {
                Ok(Ok(summary)) => writer_summary = Some(summary),
                Ok(Err(e)) => {
                    error!("Plane writer shutdown failed: {}", e);
                    self.storage_error.get_or_insert(e.to_string());
                }
                Err(e) => {
                    error!("Plane writer shutdown task failed: {}", e);
                    self.storage_error.get_or_insert(e.to_string());
                }
            }
        }

        info!(
            planes = self.planes.len(),
            received = self.frames_received,
            missing = self.missing.len(),
            late = self.late_frames,
            "Data intake finished"
        );
        IntakeReport {
            planes: self.planes,
            missing: self.missing,
            frames_received: self.frames_received,
            late_frames: self.late_frames,
            unexpected_frames: self.unexpected_frames,
            rejected_frames,
            writer: writer_summary,
            storage_error: self.storage_error,
        }
    }
}

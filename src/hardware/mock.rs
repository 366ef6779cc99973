//! Mock Hardware Implementations
//!
//! Simulated devices for running experiments without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! The mocks are wired together the way real hardware is: `MockExecutor` plays a compiled
//! profile against the clock and broadcasts every output change on a [`LineBus`]; armed
//! cameras, lights and stages listen to that bus and react to the edges on their own lines.
//!
//! # Available Mocks
//!
//! - `MockExecutor` - Plays compiled profiles; can simulate a dropped connection
//! - `MockCamera` - Exposes between rising and falling trigger edges; can drop frames
//! - `MockLight` - Emits while its trigger line is high
//! - `MockStage` - Follows its analog line; constant movement and settle time
//!
//! # Failure Injection
//!
//! - `MockExecutor::with_fail_after` - connection drops a fixed time after `start`
//! - `MockCamera::with_dropped_frames` - never delivers the listed frame indices
//! - `MockCamera::with_delivery_delay` - per-camera latency (frames arrive out of order across cameras)
//! - `with_arm_failure` / `with_hung_disarm` on cameras, lights and stages
//! - `with_arm_delay` on cameras and lights - slow acknowledgement of `arm`
//! - `MockStage::with_position_failure` - position readback errors

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::data::frame::{FrameMetadata, ImageFrame};
use crate::data::intake::FrameSink;
use crate::events::{EventBus, StageMoved};
use crate::experiment::compiler::{CompiledProfile, TimelineStep};
use crate::hardware::capabilities::{
    AnalogLine, Armable, Camera, DigitalLine, HardwareStatus, LightSource, MovementTime,
    OutputState, StageAxis, TimingExecutor,
};

const LINE_BUS_CAPACITY: usize = 4096;

// =============================================================================
// LineBus - Simulated Wiring
// =============================================================================

/// A change on the executor outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineEvent {
    /// Digital output word changed
    Digital {
        /// Time since playback start
        at: Duration,
        /// Word before the change
        previous: u32,
        /// Word after the change
        current: u32,
    },
    /// One analog output changed
    Analog {
        /// Time since playback start
        at: Duration,
        /// Analog output index
        line: u8,
        /// New level
        level: f64,
    },
}

/// Simulated cabling between the mock executor and the mock devices.
#[derive(Debug, Clone)]
pub struct LineBus {
    tx: broadcast::Sender<LineEvent>,
}

impl LineBus {
    /// New, unconnected bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LINE_BUS_CAPACITY);
        Self { tx }
    }

    /// Listen to output changes
    pub fn subscribe(&self) -> broadcast::Receiver<LineEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: LineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for LineBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener task handle shared by the armed mocks.
#[derive(Default)]
struct Listener {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    fn start(&self, task: JoinHandle<()>) {
        if let Some(old) = self.task.lock().replace(task) {
            old.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared failure switches for the armable mocks.
#[derive(Default)]
struct Faults {
    fail_arm: AtomicBool,
    hang_disarm: AtomicBool,
    disconnected: AtomicBool,
    fail_position: AtomicBool,
    arm_delay_us: AtomicU64,
}

impl Faults {
    fn check_arm(&self, id: &str) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            bail!("{}: disconnected", id);
        }
        if self.fail_arm.load(Ordering::SeqCst) {
            bail!("{}: device busy", id);
        }
        Ok(())
    }

    async fn arm_delay(&self) {
        let delay = self.arm_delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_micros(delay)).await;
        }
    }

    fn set_arm_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.arm_delay_us.store(micros, Ordering::SeqCst);
    }

    async fn disarm_delay(&self) {
        if self.hang_disarm.load(Ordering::SeqCst) {
            // never acknowledges; the caller's grace period decides
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// MockExecutor - Simulated Timing Device
// =============================================================================

#[derive(Default)]
struct PlaybackState {
    profile: Option<Arc<CompiledProfile>>,
    running: bool,
    started_at: Option<Instant>,
    cycles_completed: u32,
    last_tick: Option<u64>,
    output: OutputState,
    fail_after: Option<Duration>,
    link_down: bool,
}

impl PlaybackState {
    fn check_link(&mut self) -> Result<()> {
        if let (Some(limit), Some(started)) = (self.fail_after, self.started_at) {
            if started.elapsed() >= limit {
                self.link_down = true;
                self.running = false;
            }
        }
        if self.link_down {
            bail!("MockExecutor: link down");
        }
        Ok(())
    }
}

/// Mock timing executor
///
/// Plays compiled profiles against the tokio clock:
/// - One playback task per `start`, sleeping until each step's tick
/// - Every output change is broadcast on the executor's [`LineBus`]
/// - Progress is reported as completed passes plus the last tick executed
///
/// # Example
///
/// ```rust,ignore
/// let executor = MockExecutor::new(&ExecutorConfig::default());
/// executor.upload(profile).await?;
/// executor.start().await?;
/// ```
pub struct MockExecutor {
    state: Arc<Mutex<PlaybackState>>,
    playback: Mutex<Option<JoinHandle<()>>>,
    bus: LineBus,
}

impl MockExecutor {
    /// Create an idle executor with all outputs low
    pub fn new(config: &ExecutorConfig) -> Self {
        let state = PlaybackState {
            output: OutputState {
                digital: 0,
                analog: vec![0.0; usize::from(config.analog_lines)],
            },
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            playback: Mutex::new(None),
            bus: LineBus::new(),
        }
    }

    /// Drop the connection `after` playback has been running that long
    pub fn with_fail_after(self, after: Duration) -> Self {
        self.state.lock().fail_after = Some(after);
        self
    }

    /// Bus the executor drives
    pub fn line_bus(&self) -> LineBus {
        self.bus.clone()
    }

    /// Whether the simulated connection has dropped
    pub fn is_link_down(&self) -> bool {
        self.state.lock().link_down
    }

    async fn play(
        state: Arc<Mutex<PlaybackState>>,
        bus: LineBus,
        profile: Arc<CompiledProfile>,
        started: Instant,
    ) {
        let timeline = profile.timeline();
        for cycle in 0..profile.repeat_count {
            let origin = u64::from(cycle) * profile.duration_ticks;
            for step in &timeline {
                let at = profile.tick_to_duration(origin + step.tick());
                sleep_until(started + at).await;

                let mut st = state.lock();
                if st.check_link().is_err() {
                    warn!("MockExecutor: connection dropped during playback");
                    return;
                }
                match *step {
                    TimelineStep::Digital { state: word, .. } => {
                        let previous = st.output.digital;
                        st.output.digital = word;
                        if previous != word {
                            bus.publish(LineEvent::Digital {
                                at,
                                previous,
                                current: word,
                            });
                        }
                    }
                    TimelineStep::Analog { line, level, .. } => {
                        if let Some(slot) = st.output.analog.get_mut(usize::from(line)) {
                            *slot = level;
                        }
                        bus.publish(LineEvent::Analog { at, line, level });
                    }
                }
                st.last_tick = Some(step.tick());
            }
            let mut st = state.lock();
            st.cycles_completed = cycle + 1;
            st.last_tick = None;
        }
        state.lock().running = false;
        debug!("MockExecutor: playback finished");
    }
}

#[async_trait]
impl TimingExecutor for MockExecutor {
    async fn upload(&self, profile: Arc<CompiledProfile>) -> Result<()> {
        let mut st = self.state.lock();
        st.check_link()?;
        if st.running {
            bail!("MockExecutor: cannot upload while a profile is playing");
        }
        debug!(
            rows = profile.digital.len(),
            ticks = profile.duration_ticks,
            "MockExecutor: profile loaded"
        );
        st.profile = Some(profile);
        st.cycles_completed = 0;
        st.last_tick = None;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let started = Instant::now();
        let profile = {
            let mut st = self.state.lock();
            st.check_link()?;
            if st.running {
                bail!("MockExecutor: already running");
            }
            let profile = st
                .profile
                .clone()
                .ok_or_else(|| anyhow!("MockExecutor: no profile loaded"))?;
            st.running = true;
            st.started_at = Some(started);
            st.cycles_completed = 0;
            st.last_tick = None;
            profile
        };

        let task = tokio::spawn(Self::play(
            self.state.clone(),
            self.bus.clone(),
            profile,
            started,
        ));
        if let Some(old) = self.playback.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        if let Some(task) = self.playback.lock().take() {
            task.abort();
        }
        let mut st = self.state.lock();
        st.running = false;
        st.check_link()
    }

    async fn set_idle(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.check_link()?;
        let previous = st.output.digital;
        st.output.digital = 0;
        if previous != 0 {
            let at = st.started_at.map(|s| s.elapsed()).unwrap_or_default();
            self.bus.publish(LineEvent::Digital {
                at,
                previous,
                current: 0,
            });
        }
        Ok(())
    }

    async fn status(&self) -> Result<HardwareStatus> {
        let mut st = self.state.lock();
        st.check_link()?;
        Ok(HardwareStatus {
            running: st.running,
            cycles_completed: st.cycles_completed,
            last_tick: st.last_tick,
            fault: None,
        })
    }

    async fn output_state(&self) -> Result<OutputState> {
        let mut st = self.state.lock();
        st.check_link()?;
        Ok(st.output.clone())
    }
}

impl Drop for MockExecutor {
    fn drop(&mut self) {
        if let Some(task) = self.playback.lock().take() {
            task.abort();
        }
    }
}

// =============================================================================
// MockCamera - Simulated Trigger-Driven Camera
// =============================================================================

/// Configuration of a `mock_camera` device entry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockCameraConfig {
    /// Trigger line
    pub line: u8,
    /// Minimum exposure
    #[serde(with = "humantime_serde")]
    pub min_exposure: Duration,
    /// Readout time between exposures
    #[serde(with = "humantime_serde")]
    pub readout_time: Duration,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            line: 0,
            min_exposure: Duration::from_millis(1),
            readout_time: Duration::ZERO,
            width: 64,
            height: 64,
        }
    }
}

struct CameraShared {
    id: String,
    resolution: (u32, u32),
    next_index: AtomicU64,
    sink: Mutex<Option<FrameSink>>,
    dropped: Mutex<HashSet<u64>>,
    delivery_delay: Mutex<Duration>,
}

impl CameraShared {
    fn emit(&self, opened: Duration, closed: Duration) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        if self.dropped.lock().contains(&index) {
            debug!(camera = %self.id, index, "MockCamera: dropping frame");
            return;
        }
        let Some(sink) = self.sink.lock().clone() else {
            debug!(camera = %self.id, index, "MockCamera: no sink attached");
            return;
        };

        let (width, height) = self.resolution;
        let pixels: Vec<u16> = (0..width * height)
            .map(|i| ((u64::from(i) + index) % 65536) as u16)
            .collect();
        let frame = ImageFrame::new(self.id.clone(), index, width, height, pixels).with_metadata(
            FrameMetadata {
                timestamp: closed,
                exposure: closed.saturating_sub(opened),
                stage_position: None,
                wavelength_nm: None,
            },
        );

        let delay = *self.delivery_delay.lock();
        if delay.is_zero() {
            sink.on_frame_arrived(frame);
        } else {
            tokio::spawn(async move {
                sleep(delay).await;
                sink.on_frame_arrived(frame);
            });
        }
    }
}

/// Mock camera driven by its trigger line
///
/// Simulates a camera with:
/// - Exposure from rising to falling edge of its trigger line
/// - Frames pushed into the attached sink when the exposure closes
/// - Frame indices counted from zero at every `arm`
pub struct MockCamera {
    shared: Arc<CameraShared>,
    line: DigitalLine,
    min_exposure: Duration,
    readout_time: Duration,
    bus: LineBus,
    armed: AtomicBool,
    listener: Listener,
    faults: Faults,
}

impl MockCamera {
    /// Create a camera on `line` listening to `bus`
    pub fn new(id: &str, line: DigitalLine, bus: LineBus) -> Self {
        Self::from_config(
            id,
            &MockCameraConfig {
                line: line.0,
                ..Default::default()
            },
            bus,
        )
    }

    /// Create a camera from its configuration entry
    pub fn from_config(id: &str, config: &MockCameraConfig, bus: LineBus) -> Self {
        Self {
            shared: Arc::new(CameraShared {
                id: id.to_string(),
                resolution: (config.width, config.height),
                next_index: AtomicU64::new(0),
                sink: Mutex::new(None),
                dropped: Mutex::new(HashSet::new()),
                delivery_delay: Mutex::new(Duration::ZERO),
            }),
            line: DigitalLine(config.line),
            min_exposure: config.min_exposure,
            readout_time: config.readout_time,
            bus,
            armed: AtomicBool::new(false),
            listener: Listener::default(),
            faults: Faults::default(),
        }
    }

    /// Set minimum exposure
    pub fn with_min_exposure(mut self, min_exposure: Duration) -> Self {
        self.min_exposure = min_exposure;
        self
    }

    /// Set readout time
    pub fn with_readout_time(mut self, readout_time: Duration) -> Self {
        self.readout_time = readout_time;
        self
    }

    /// Never deliver these frame indices
    pub fn with_dropped_frames(self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.shared.dropped.lock().extend(indices);
        self
    }

    /// Delay every delivery by `delay`
    pub fn with_delivery_delay(self, delay: Duration) -> Self {
        *self.shared.delivery_delay.lock() = delay;
        self
    }

    /// Reject `arm`
    pub fn with_arm_failure(self) -> Self {
        self.faults.fail_arm.store(true, Ordering::SeqCst);
        self
    }

    /// Never acknowledge `disarm`
    pub fn with_hung_disarm(self) -> Self {
        self.faults.hang_disarm.store(true, Ordering::SeqCst);
        self
    }

    /// Take `delay` to acknowledge `arm`
    pub fn with_arm_delay(self, delay: Duration) -> Self {
        self.faults.set_arm_delay(delay);
        self
    }

    /// Frames exposed since the last `arm` (delivered or not)
    pub fn frames_exposed(&self) -> u64 {
        self.shared.next_index.load(Ordering::SeqCst)
    }

    /// Whether the camera was force-disconnected
    pub fn was_force_disconnected(&self) -> bool {
        self.faults.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Armable for MockCamera {
    async fn arm(&self) -> Result<()> {
        self.faults.check_arm(&self.shared.id)?;
        self.faults.arm_delay().await;
        self.shared.next_index.store(0, Ordering::SeqCst);

        let mut rx = self.bus.subscribe();
        let shared = self.shared.clone();
        let mask = self.line.mask();
        self.listener.start(tokio::spawn(async move {
            let mut opened: Option<Duration> = None;
            loop {
                match rx.recv().await {
                    Ok(LineEvent::Digital {
                        at,
                        previous,
                        current,
                    }) => {
                        let was = previous & mask != 0;
                        let is = current & mask != 0;
                        if is && !was {
                            opened = Some(at);
                        } else if was && !is {
                            if let Some(start) = opened.take() {
                                shared.emit(start, at);
                            }
                        }
                    }
                    Ok(LineEvent::Analog { .. }) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(camera = %shared.id, missed = n, "MockCamera: line events lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        self.armed.store(true, Ordering::SeqCst);
        debug!(camera = %self.shared.id, "MockCamera: armed");
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        self.faults.disarm_delay().await;
        self.listener.stop();
        self.armed.store(false, Ordering::SeqCst);
        debug!(camera = %self.shared.id, "MockCamera: disarmed");
        Ok(())
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }

    fn force_disconnect(&self) {
        self.listener.stop();
        self.armed.store(false, Ordering::SeqCst);
        self.faults.disconnected.store(true, Ordering::SeqCst);
    }
}

impl Camera for MockCamera {
    fn trigger_line(&self) -> DigitalLine {
        self.line
    }

    fn min_exposure(&self) -> Duration {
        self.min_exposure
    }

    fn readout_time(&self) -> Duration {
        self.readout_time
    }

    fn resolution(&self) -> (u32, u32) {
        self.shared.resolution
    }

    fn attach_frame_sink(&self, sink: FrameSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn detach_frame_sink(&self) {
        self.shared.sink.lock().take();
    }
}

// =============================================================================
// MockLight - Simulated Gated Light Source
// =============================================================================

/// Configuration of a `mock_light` device entry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockLightConfig {
    /// Enable line
    pub line: u8,
    /// Shutter line, if the light has a shutter
    pub shutter_line: Option<u8>,
    /// Wavelength in nanometers
    pub wavelength_nm: f64,
}

impl Default for MockLightConfig {
    fn default() -> Self {
        Self {
            line: 1,
            shutter_line: None,
            wavelength_nm: 488.0,
        }
    }
}

/// Mock light source that emits while its enable line is high
pub struct MockLight {
    id: String,
    line: DigitalLine,
    shutter: Option<DigitalLine>,
    wavelength_nm: f64,
    bus: LineBus,
    emitting: Arc<AtomicBool>,
    pulses: Arc<AtomicU64>,
    armed: AtomicBool,
    listener: Listener,
    faults: Faults,
}

impl MockLight {
    /// Create a light on `line` listening to `bus`
    pub fn new(id: &str, line: DigitalLine, wavelength_nm: f64, bus: LineBus) -> Self {
        Self::from_config(
            id,
            &MockLightConfig {
                line: line.0,
                shutter_line: None,
                wavelength_nm,
            },
            bus,
        )
    }

    /// Create a light from its configuration entry
    pub fn from_config(id: &str, config: &MockLightConfig, bus: LineBus) -> Self {
        Self {
            id: id.to_string(),
            line: DigitalLine(config.line),
            shutter: config.shutter_line.map(DigitalLine),
            wavelength_nm: config.wavelength_nm,
            bus,
            emitting: Arc::new(AtomicBool::new(false)),
            pulses: Arc::new(AtomicU64::new(0)),
            armed: AtomicBool::new(false),
            listener: Listener::default(),
            faults: Faults::default(),
        }
    }

    /// Add a shutter line
    pub fn with_shutter(mut self, line: DigitalLine) -> Self {
        self.shutter = Some(line);
        self
    }

    /// Reject `arm`
    pub fn with_arm_failure(self) -> Self {
        self.faults.fail_arm.store(true, Ordering::SeqCst);
        self
    }

    /// Take `delay` to acknowledge `arm`
    pub fn with_arm_delay(self, delay: Duration) -> Self {
        self.faults.set_arm_delay(delay);
        self
    }

    /// Pulses seen since the last `arm`
    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Armable for MockLight {
    async fn arm(&self) -> Result<()> {
        self.faults.check_arm(&self.id)?;
        self.faults.arm_delay().await;
        self.pulses.store(0, Ordering::SeqCst);

        let mut rx = self.bus.subscribe();
        let emitting = self.emitting.clone();
        let pulses = self.pulses.clone();
        let mask = self.line.mask();
        self.listener.start(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(LineEvent::Digital {
                        previous, current, ..
                    }) => {
                        let on = current & mask != 0;
                        if on && previous & mask == 0 {
                            pulses.fetch_add(1, Ordering::SeqCst);
                        }
                        emitting.store(on, Ordering::SeqCst);
                    }
                    Ok(LineEvent::Analog { .. }) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        self.faults.disarm_delay().await;
        self.listener.stop();
        self.emitting.store(false, Ordering::SeqCst);
        self.armed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }

    fn force_disconnect(&self) {
        self.listener.stop();
        self.emitting.store(false, Ordering::SeqCst);
        self.armed.store(false, Ordering::SeqCst);
        self.faults.disconnected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LightSource for MockLight {
    fn trigger_line(&self) -> DigitalLine {
        self.line
    }

    fn shutter_line(&self) -> Option<DigitalLine> {
        self.shutter
    }

    fn wavelength_nm(&self) -> f64 {
        self.wavelength_nm
    }

    async fn is_emitting(&self) -> Result<bool> {
        Ok(self.emitting.load(Ordering::SeqCst))
    }
}

// =============================================================================
// MockStage - Simulated Analog-Driven Stage
// =============================================================================

/// Configuration of a `mock_stage` device entry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockStageConfig {
    /// Analog line
    pub line: u8,
    /// Output units per stage unit
    pub gain: f64,
    /// Stage-unit offset
    pub offset: f64,
    /// Motion time per move
    #[serde(with = "humantime_serde")]
    pub motion_time: Duration,
    /// Settle time after motion
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Smallest resolvable step
    pub min_step: f64,
    /// Initial position
    pub position: f64,
}

impl Default for MockStageConfig {
    fn default() -> Self {
        Self {
            line: 0,
            gain: 1.0,
            offset: 0.0,
            motion_time: Duration::from_millis(5),
            settle_time: Duration::from_millis(1),
            min_step: 0.0,
            position: 0.0,
        }
    }
}

/// Mock stage axis following its analog line
///
/// Simulates a stage with:
/// - Constant motion and settle time per move, independent of distance
/// - Position tracking from analog levels while armed
/// - `StageMoved` events when an event bus is attached
pub struct MockStage {
    id: String,
    analog: AnalogLine,
    movement: MovementTime,
    min_step: f64,
    position: Arc<Mutex<f64>>,
    bus: LineBus,
    events: Option<EventBus>,
    armed: AtomicBool,
    listener: Listener,
    faults: Faults,
}

impl MockStage {
    /// Create a stage on analog `line` with unit gain
    pub fn new(id: &str, line: u8, bus: LineBus) -> Self {
        Self::from_config(
            id,
            &MockStageConfig {
                line,
                ..Default::default()
            },
            bus,
        )
    }

    /// Create a stage from its configuration entry
    pub fn from_config(id: &str, config: &MockStageConfig, bus: LineBus) -> Self {
        Self {
            id: id.to_string(),
            analog: AnalogLine {
                line: config.line,
                gain: config.gain,
                offset: config.offset,
            },
            movement: MovementTime {
                motion: config.motion_time,
                settle: config.settle_time,
            },
            min_step: config.min_step,
            position: Arc::new(Mutex::new(config.position)),
            bus,
            events: None,
            armed: AtomicBool::new(false),
            listener: Listener::default(),
            faults: Faults::default(),
        }
    }

    /// Publish `StageMoved` on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Set motion and settle time
    pub fn with_movement_time(mut self, motion: Duration, settle: Duration) -> Self {
        self.movement = MovementTime { motion, settle };
        self
    }

    /// Set minimum step
    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    /// Set starting position
    pub fn with_position(self, position: f64) -> Self {
        *self.position.lock() = position;
        self
    }

    /// Reject `arm`
    pub fn with_arm_failure(self) -> Self {
        self.faults.fail_arm.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every position readback
    pub fn with_position_failure(self) -> Self {
        self.faults.fail_position.store(true, Ordering::SeqCst);
        self
    }

    fn publish(&self, position: f64) {
        if let Some(events) = &self.events {
            events.stage_moved(StageMoved {
                device: self.id.clone(),
                position,
            });
        }
    }
}

#[async_trait]
impl Armable for MockStage {
    async fn arm(&self) -> Result<()> {
        self.faults.check_arm(&self.id)?;

        let mut rx = self.bus.subscribe();
        let analog = self.analog;
        let position = self.position.clone();
        let events = self.events.clone();
        let id = self.id.clone();
        self.listener.start(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(LineEvent::Analog { line, level, .. }) if line == analog.line => {
                        let target = analog.position_for(level);
                        *position.lock() = target;
                        if let Some(events) = &events {
                            events.stage_moved(StageMoved {
                                device: id.clone(),
                                position: target,
                            });
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        self.faults.disarm_delay().await;
        self.listener.stop();
        self.armed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }

    fn force_disconnect(&self) {
        self.listener.stop();
        self.armed.store(false, Ordering::SeqCst);
        self.faults.disconnected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageAxis for MockStage {
    fn analog_line(&self) -> AnalogLine {
        self.analog
    }

    fn movement_time(&self, _from: f64, _to: f64) -> MovementTime {
        self.movement
    }

    fn min_step(&self) -> f64 {
        self.min_step
    }

    async fn position(&self) -> Result<f64> {
        if self.faults.fail_position.load(Ordering::SeqCst) {
            bail!("{}: position readback failed", self.id);
        }
        Ok(*self.position.lock())
    }

    async fn move_abs(&self, target: f64) -> Result<()> {
        if self.faults.disconnected.load(Ordering::SeqCst) {
            bail!("{}: disconnected", self.id);
        }
        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(self.movement.total()).await;
        *self.position.lock() = target;
        self.publish(target);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::intake::FrameSink;
    use crate::experiment::compiler::DigitalRow;
    use tokio::sync::mpsc;

    fn profile(rows: Vec<(u64, u32)>, duration_ticks: u64, repeat_count: u32) -> Arc<CompiledProfile> {
        Arc::new(CompiledProfile {
            ticks_per_second: 100_000,
            duration_ticks,
            repeat_count,
            digital: rows
                .into_iter()
                .map(|(tick, state)| DigitalRow { tick, state })
                .collect(),
            analog: Vec::new(),
            entry_ticks: Vec::new(),
        })
    }

    async fn wait_until_stopped(executor: &MockExecutor) -> HardwareStatus {
        loop {
            let status = executor.status().await.unwrap();
            if !status.running {
                return status;
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_executor_plays_all_cycles() {
        let executor = MockExecutor::new(&ExecutorConfig::default());
        executor
            .upload(profile(vec![(0, 0), (100, 1), (200, 0), (300, 0)], 300, 2))
            .await
            .unwrap();
        executor.start().await.unwrap();

        let status = wait_until_stopped(&executor).await;
        assert_eq!(status.cycles_completed, 2);
        assert_eq!(executor.output_state().await.unwrap().digital, 0);
    }

    #[tokio::test]
    async fn test_executor_start_requires_profile() {
        let executor = MockExecutor::new(&ExecutorConfig::default());
        assert!(executor.start().await.is_err());
    }

    #[tokio::test]
    async fn test_executor_link_drop() {
        let executor = MockExecutor::new(&ExecutorConfig::default())
            .with_fail_after(Duration::from_millis(5));
        executor
            .upload(profile(vec![(0, 1), (10_000, 0)], 10_000, 1))
            .await
            .unwrap();
        executor.start().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(executor.status().await.is_err());
        assert!(executor.is_link_down());
    }

    #[tokio::test]
    async fn test_set_idle_drops_outputs() {
        let executor = MockExecutor::new(&ExecutorConfig::default());
        executor
            .upload(profile(vec![(0, 0b11), (100_000, 0)], 100_000, 1))
            .await
            .unwrap();
        executor.start().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.output_state().await.unwrap().digital, 0b11);

        executor.abort().await.unwrap();
        executor.set_idle().await.unwrap();
        assert_eq!(executor.output_state().await.unwrap().digital, 0);
        assert!(!executor.status().await.unwrap().running);
    }

    #[tokio::test]
    async fn test_camera_exposes_on_trigger_edges() {
        let executor = MockExecutor::new(&ExecutorConfig::default());
        let camera = MockCamera::new("cam_a", DigitalLine(0), executor.line_bus())
            .with_dropped_frames([1]);
        let (tx, mut rx) = mpsc::channel(8);
        camera.attach_frame_sink(FrameSink::new(tx));
        camera.arm().await.unwrap();

        // three 1 ms pulses on line 0
        executor
            .upload(profile(
                vec![(0, 1), (100, 0), (200, 1), (300, 0), (400, 1), (500, 0), (600, 0)],
                600,
                1,
            ))
            .await
            .unwrap();
        executor.start().await.unwrap();
        wait_until_stopped(&executor).await;
        sleep(Duration::from_millis(5)).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.frame_index, 0);
        assert_eq!(second.frame_index, 2);
        assert_eq!(first.metadata.exposure, Duration::from_millis(1));
        assert_eq!(camera.frames_exposed(), 3);

        camera.disarm().await.unwrap();
        assert!(!camera.is_armed().await.unwrap());
    }

    #[tokio::test]
    async fn test_light_follows_line() {
        let executor = MockExecutor::new(&ExecutorConfig::default());
        let light = MockLight::new("laser_488", DigitalLine(1), 488.0, executor.line_bus());
        light.arm().await.unwrap();

        executor
            .upload(profile(vec![(0, 0b10), (100_000, 0)], 100_000, 1))
            .await
            .unwrap();
        executor.start().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(light.is_emitting().await.unwrap());
        assert_eq!(light.pulse_count(), 1);

        executor.abort().await.unwrap();
        executor.set_idle().await.unwrap();
        sleep(Duration::from_millis(5)).await;
        assert!(!light.is_emitting().await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_follows_analog_line() {
        let events = EventBus::default();
        let mut moves = events.subscribe_stage();
        let executor = MockExecutor::new(&ExecutorConfig::default());
        let stage = MockStage::from_config(
            "stage_z",
            &MockStageConfig {
                gain: 0.5,
                ..Default::default()
            },
            executor.line_bus(),
        )
        .with_events(events.clone());
        stage.arm().await.unwrap();

        let mut p = (*profile(vec![(0, 0), (200, 0)], 200, 1)).clone();
        p.analog.push(crate::experiment::compiler::AnalogTrack {
            line: 0,
            points: vec![crate::experiment::compiler::AnalogPoint { tick: 100, level: 2.0 }],
        });
        executor.upload(Arc::new(p)).await.unwrap();
        executor.start().await.unwrap();
        wait_until_stopped(&executor).await;
        sleep(Duration::from_millis(5)).await;

        assert!((stage.position().await.unwrap() - 4.0).abs() < 1e-9);
        assert!((moves.recv().await.unwrap().position - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stage_direct_move() {
        let stage = MockStage::new("stage_z", 0, LineBus::new())
            .with_movement_time(Duration::from_millis(2), Duration::from_millis(1));
        stage.move_abs(12.5).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 12.5);
        assert_eq!(stage.movement_time(0.0, 1.0).total(), Duration::from_millis(3));
    }

    #[tokio::test]
    async fn test_arm_failure_and_force_disconnect() {
        let camera = MockCamera::new("cam_a", DigitalLine(0), LineBus::new()).with_arm_failure();
        assert!(camera.arm().await.is_err());

        let camera = MockCamera::new("cam_b", DigitalLine(0), LineBus::new()).with_hung_disarm();
        camera.arm().await.unwrap();
        let hung = tokio::time::timeout(Duration::from_millis(20), camera.disarm()).await;
        assert!(hung.is_err());
        camera.force_disconnect();
        assert!(camera.was_force_disconnected());
        assert!(!camera.is_armed().await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_arm_and_position_failure() {
        let light = MockLight::new("laser_488", DigitalLine(1), 488.0, LineBus::new())
            .with_arm_delay(Duration::from_millis(50));
        let early = tokio::time::timeout(Duration::from_millis(10), light.arm()).await;
        assert!(early.is_err());
        assert!(!light.is_armed().await.unwrap());
        light.arm().await.unwrap();
        assert!(light.is_armed().await.unwrap());

        let stage = MockStage::new("stage_z", 0, LineBus::new()).with_position_failure();
        assert!(stage.position().await.is_err());
    }
}

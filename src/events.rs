//! Typed event channels.
//!
//! One `tokio::sync::broadcast` channel per event category. Publishers never block and never
//! fail when nobody listens; slow subscribers observe `RecvError::Lagged` instead of holding up
//! the publisher.

use crate::data::frame::SlotKey;
use crate::experiment::state::ExperimentState;
use crate::hardware::registry::DeviceId;
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// A frame was committed to a slot by the data intake.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameArrived {
    /// Run that produced the frame
    pub run_id: String,
    /// Slot the frame filled
    pub slot: SlotKey,
    /// Capture time relative to experiment start
    pub elapsed: Duration,
}

/// A stage axis reached a new position.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMoved {
    /// Stage axis
    pub device: DeviceId,
    /// New position in device units
    pub position: f64,
}

/// The experiment state machine changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChanged {
    /// Run the transition belongs to (None before a run id is assigned)
    pub run_id: Option<String>,
    /// Previous state
    pub from: ExperimentState,
    /// New state
    pub to: ExperimentState,
}

/// A device reported an error or was force-disconnected.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFault {
    /// Faulting device ("executor" for the timing executor)
    pub device: DeviceId,
    /// Description
    pub message: String,
    /// Whether the device is unusable for the rest of the run
    pub unrecoverable: bool,
}

/// Broadcast channels for every event category.
///
/// Cloning shares the underlying channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    frames: broadcast::Sender<FrameArrived>,
    stage: broadcast::Sender<StageMoved>,
    state: broadcast::Sender<StateChanged>,
    faults: broadcast::Sender<DeviceFault>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create channels with room for `capacity` undelivered events each.
    pub fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity);
        let (stage, _) = broadcast::channel(capacity);
        let (state, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        Self {
            frames,
            stage,
            state,
            faults,
        }
    }

    /// Subscribe to committed frames
    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameArrived> {
        self.frames.subscribe()
    }

    /// Subscribe to stage moves
    pub fn subscribe_stage(&self) -> broadcast::Receiver<StageMoved> {
        self.stage.subscribe()
    }

    /// Subscribe to state machine transitions
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChanged> {
        self.state.subscribe()
    }

    /// Subscribe to device faults
    pub fn subscribe_faults(&self) -> broadcast::Receiver<DeviceFault> {
        self.faults.subscribe()
    }

    /// Publish a committed frame
    pub fn frame_arrived(&self, event: FrameArrived) {
        let _ = self.frames.send(event);
    }

    /// Publish a stage move
    pub fn stage_moved(&self, event: StageMoved) {
        let _ = self.stage.send(event);
    }

    /// Publish a state transition
    pub fn state_changed(&self, event: StateChanged) {
        let _ = self.state.send(event);
    }

    /// Publish a device fault
    pub fn device_fault(&self, event: DeviceFault) {
        let _ = self.faults.send(event);
    }
}

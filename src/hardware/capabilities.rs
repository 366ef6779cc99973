//! Hardware Capabilities
//!
//! Role traits for the devices that take part in a hardware-timed experiment. The timing
//! executor drives every device through its output lines; the traits describe what the
//! builder needs to know to schedule a device (trigger line, minimum exposure, movement
//! time) and what the engine needs to prepare and release it (arm, disarm).
//!
//! - A camera implements: `Armable + Camera`
//! - A light source implements: `Armable + LightSource`
//! - A Z stage implements: `Armable + StageAxis`
//! - The timing device implements: `TimingExecutor`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async where it talks to hardware (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Exposes static wiring facts (lines, minimums) as plain getters
//!
//! # Example
//!
//! ```rust,ignore
//! async fn prepare<C: Camera>(camera: &C, sink: FrameSink) -> Result<()> {
//!     camera.attach_frame_sink(sink);
//!     camera.arm().await?;
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::data::intake::FrameSink;
use crate::experiment::compiler::CompiledProfile;

// =============================================================================
// Wiring
// =============================================================================

/// A digital output line of the timing executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DigitalLine(pub u8);

impl DigitalLine {
    /// Bit of this line in the executor's digital output word.
    ///
    /// Zero for lines past the width of the word.
    pub fn mask(self) -> u32 {
        1u32.checked_shl(u32::from(self.0)).unwrap_or(0)
    }
}

/// An analog output line together with the conversion from device units to output level.
///
/// `level = gain * (offset + position)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalogLine {
    /// Executor analog output index
    pub line: u8,
    /// Output units per device unit
    pub gain: f64,
    /// Device-unit offset applied before scaling
    pub offset: f64,
}

impl AnalogLine {
    /// Convert a device position into an executor output level.
    pub fn level_for(&self, position: f64) -> f64 {
        self.gain * (self.offset + position)
    }

    /// Convert an executor output level back into a device position.
    pub fn position_for(&self, level: f64) -> f64 {
        if self.gain == 0.0 {
            return -self.offset;
        }
        level / self.gain - self.offset
    }
}

/// Time a stage needs for one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MovementTime {
    /// Motion time
    pub motion: Duration,
    /// Stabilization time after motion
    pub settle: Duration,
}

impl MovementTime {
    /// Motion plus stabilization.
    pub fn total(&self) -> Duration {
        self.motion + self.settle
    }
}

// =============================================================================
// Armable - Prepare / Release
// =============================================================================

/// Capability: enter and leave externally triggered mode.
///
/// # Contract
/// - `arm()` puts the device under executor control; it must not emit until a line edge
/// - `disarm()` returns the device to its idle state
/// - `force_disconnect()` drops the device connection without waiting for acknowledgement
#[async_trait]
pub trait Armable: Send + Sync {
    /// Enter armed mode
    async fn arm(&self) -> Result<()>;

    /// Leave armed mode
    async fn disarm(&self) -> Result<()>;

    /// Query armed state
    async fn is_armed(&self) -> Result<bool>;

    /// Drop the connection after a disarm that was never acknowledged.
    fn force_disconnect(&self) {}
}

// =============================================================================
// Camera
// =============================================================================

/// Capability: hardware-triggered camera.
///
/// Frames are pushed into the attached [`FrameSink`] from whatever context the adapter
/// delivers them in. Pushing never blocks.
pub trait Camera: Armable {
    /// Digital line that starts an exposure on its rising edge
    fn trigger_line(&self) -> DigitalLine;

    /// Shortest exposure the camera accepts
    fn min_exposure(&self) -> Duration;

    /// Time after an exposure ends before the camera can be triggered again
    fn readout_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Frame size (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Route frames into `sink` until detached
    fn attach_frame_sink(&self, sink: FrameSink);

    /// Stop routing frames
    fn detach_frame_sink(&self);
}

// =============================================================================
// LightSource
// =============================================================================

/// Capability: light source gated by a digital line.
#[async_trait]
pub trait LightSource: Armable {
    /// Digital line that enables emission while high
    fn trigger_line(&self) -> DigitalLine;

    /// Shutter line that must be open for the light to reach the sample
    fn shutter_line(&self) -> Option<DigitalLine> {
        None
    }

    /// Excitation wavelength in nanometers
    fn wavelength_nm(&self) -> f64;

    /// Whether the source is currently emitting
    async fn is_emitting(&self) -> Result<bool>;
}

// =============================================================================
// StageAxis
// =============================================================================

/// Capability: positioning axis driven by an analog line.
#[async_trait]
pub trait StageAxis: Armable {
    /// Analog line and scaling that position this axis
    fn analog_line(&self) -> AnalogLine;

    /// Time to travel `from` → `to` (device units) and settle
    fn movement_time(&self, from: f64, to: f64) -> MovementTime;

    /// Smallest step the axis can resolve (device units)
    fn min_step(&self) -> f64 {
        0.0
    }

    /// Current position (device units)
    async fn position(&self) -> Result<f64>;

    /// Move to absolute position outside of a timed run
    async fn move_abs(&self, position: f64) -> Result<()>;
}

// =============================================================================
// TimingExecutor
// =============================================================================

/// Status reported by the timing device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareStatus {
    /// Whether a profile is playing
    pub running: bool,
    /// Full passes over the profile completed since `start`
    pub cycles_completed: u32,
    /// Last tick executed within the current pass (None before its first step)
    pub last_tick: Option<u64>,
    /// Fault reported by the device (connection still alive)
    pub fault: Option<String>,
}

/// Current state of the executor outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputState {
    /// Digital output word
    pub digital: u32,
    /// Analog output levels by line
    pub analog: Vec<f64>,
}

/// Capability: device that plays compiled timing profiles.
///
/// A status error means the connection to the device is gone.
#[async_trait]
pub trait TimingExecutor: Send + Sync {
    /// Load a profile, replacing any previous one
    async fn upload(&self, profile: Arc<CompiledProfile>) -> Result<()>;

    /// Begin playback of the loaded profile
    async fn start(&self) -> Result<()>;

    /// Stop playback
    async fn abort(&self) -> Result<()>;

    /// Drive all digital outputs low
    async fn set_idle(&self) -> Result<()>;

    /// Playback progress
    async fn status(&self) -> Result<HardwareStatus>;

    /// Output levels
    async fn output_state(&self) -> Result<OutputState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analog_scaling_round_trips() {
        let line = AnalogLine {
            line: 0,
            gain: 0.1,
            offset: 50.0,
        };
        assert!((line.level_for(10.0) - 6.0).abs() < 1e-12);
        assert!((line.position_for(6.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn digital_line_mask() {
        assert_eq!(DigitalLine(0).mask(), 1);
        assert_eq!(DigitalLine(5).mask(), 0b10_0000);
        assert_eq!(DigitalLine(31).mask(), 1 << 31);
        assert_eq!(DigitalLine(40).mask(), 0);
    }

    #[test]
    fn movement_total() {
        let mt = MovementTime {
            motion: Duration::from_millis(8),
            settle: Duration::from_millis(2),
        };
        assert_eq!(mt.total(), Duration::from_millis(10));
    }
}

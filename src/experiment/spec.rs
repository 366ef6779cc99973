//! Declarative experiment description.
//!
//! An [`ExperimentSpec`] is owned by the caller and consumed once by the
//! [`ActionTableBuilder`](super::builder::ActionTableBuilder). Specs are usually written in TOML:
//!
//! ```toml
//! name = "zstack_488"
//! timepoints = 2
//! timepoint_interval = "2s"
//!
//! [z_stack]
//! stage = "stage_z"
//! start = 0.0
//! step = 1.0
//! slices = 3
//!
//! [[channels]]
//! name = "488"
//! cameras = ["cam_a"]
//! light = "laser_488"
//! exposure = "50ms"
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User-declared experiment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Experiment name, used for output file names
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of timepoints per table pass
    pub timepoints: u32,
    /// Fixed start-to-start period of timepoints (None = back to back)
    #[serde(default, with = "humantime_serde")]
    pub timepoint_interval: Option<Duration>,
    /// Number of times the executor replays the whole table
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    /// Z stack (None = single plane at the current stage position)
    #[serde(default)]
    pub z_stack: Option<ZStack>,
    /// Channels acquired at every Z plane, in order
    pub channels: Vec<ChannelSpec>,
    /// Output data file (None = `<storage.output_dir>/<name>_<run_id>.raw`)
    #[serde(default)]
    pub save_path: Option<PathBuf>,
}

/// Z range of a stack acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZStack {
    /// Stage axis that moves between planes
    pub stage: DeviceId,
    /// Position of the first plane (stage units)
    pub start: f64,
    /// Distance between planes (stage units, may be negative)
    pub step: f64,
    /// Number of planes; 0 means a single plane without stage moves
    pub slices: u32,
}

impl ZStack {
    /// Stage position of plane `index`.
    pub fn position(&self, index: u32) -> f64 {
        self.start + self.step * f64::from(index)
    }
}

/// One channel: which cameras expose, under which light, for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel name (e.g. "488")
    pub name: String,
    /// Cameras exposed together for this channel
    pub cameras: Vec<DeviceId>,
    /// Light source pulsed during the exposure (None = ambient)
    #[serde(default)]
    pub light: Option<DeviceId>,
    /// Requested exposure
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Lengthen the camera window to the camera minimum instead of rejecting the experiment.
    /// The light pulse keeps the requested length and is centred in the window.
    #[serde(default)]
    pub stretch_to_camera_minimum: bool,
}

impl ChannelSpec {
    /// A channel with one camera and a light source.
    pub fn new(
        name: impl Into<String>,
        camera: impl Into<DeviceId>,
        light: Option<&str>,
        exposure: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            cameras: vec![camera.into()],
            light: light.map(str::to_string),
            exposure,
            stretch_to_camera_minimum: false,
        }
    }
}

fn default_name() -> String {
    "experiment".to_string()
}

fn default_repeat_count() -> u32 {
    1
}

impl ExperimentSpec {
    /// Single-plane spec with no channels; add channels with [`ExperimentSpec::with_channel`].
    pub fn new(name: impl Into<String>, timepoints: u32) -> Self {
        Self {
            name: name.into(),
            timepoints,
            timepoint_interval: None,
            repeat_count: 1,
            z_stack: None,
            channels: Vec::new(),
            save_path: None,
        }
    }

    /// Add a channel.
    pub fn with_channel(mut self, channel: ChannelSpec) -> Self {
        self.channels.push(channel);
        self
    }

    /// Set the Z stack.
    pub fn with_z_stack(mut self, z_stack: ZStack) -> Self {
        self.z_stack = Some(z_stack);
        self
    }

    /// Set the timepoint period.
    pub fn with_timepoint_interval(mut self, interval: Duration) -> Self {
        self.timepoint_interval = Some(interval);
        self
    }

    /// Set the table repeat count.
    pub fn with_repeat_count(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    /// Set the output path.
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Number of Z planes acquired per timepoint.
    pub fn plane_count(&self) -> u32 {
        match &self.z_stack {
            Some(stack) if stack.slices > 0 => stack.slices,
            _ => 1,
        }
    }

    /// Parse a spec from TOML text.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        toml::from_str(text)
            .map_err(|e| DaqError::InvalidSpec(format!("Failed to parse experiment spec: {}", e)))
    }

    /// Load a spec from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_spec() {
        let spec = ExperimentSpec::from_toml_str(
            r#"
            name = "stack"
            timepoints = 2
            timepoint_interval = "2s"

            [z_stack]
            stage = "stage_z"
            start = 10.0
            step = -0.5
            slices = 3

            [[channels]]
            name = "488"
            cameras = ["cam_a"]
            light = "laser_488"
            exposure = "50ms"

            [[channels]]
            name = "bf"
            cameras = ["cam_a", "cam_b"]
            exposure = "5ms"
            stretch_to_camera_minimum = true
            "#,
        )
        .unwrap();

        assert_eq!(spec.timepoints, 2);
        assert_eq!(spec.repeat_count, 1);
        assert_eq!(spec.timepoint_interval, Some(Duration::from_secs(2)));
        assert_eq!(spec.plane_count(), 3);
        assert_eq!(spec.channels[0].exposure, Duration::from_millis(50));
        assert!(spec.channels[1].light.is_none());
        assert!(spec.channels[1].stretch_to_camera_minimum);
        let stack = spec.z_stack.unwrap();
        assert!((stack.position(2) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn zero_slices_is_single_plane() {
        let spec = ExperimentSpec::new("flat", 1).with_z_stack(ZStack {
            stage: "stage_z".into(),
            start: 0.0,
            step: 1.0,
            slices: 0,
        });
        assert_eq!(spec.plane_count(), 1);
    }

    #[test]
    fn malformed_spec_is_invalid() {
        let err = ExperimentSpec::from_toml_str("timepoints = \"many\"").unwrap_err();
        assert!(matches!(err, DaqError::InvalidSpec(_)));
    }
}

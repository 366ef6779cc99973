//! Image frames, acquisition slots and per-plane metadata.

use crate::hardware::registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One (timepoint, Z, channel, camera) acquisition unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    /// Timepoint index, counted across repeats of the table
    pub timepoint: u32,
    /// Z slice index within the stack (0 for single-plane acquisitions)
    pub z_index: u32,
    /// Channel name (e.g. "488")
    pub channel: String,
    /// Camera that fills the slot
    pub camera: DeviceId,
}

impl SlotKey {
    /// Create a slot key.
    pub fn new(
        timepoint: u32,
        z_index: u32,
        channel: impl Into<String>,
        camera: impl Into<DeviceId>,
    ) -> Self {
        Self {
            timepoint,
            z_index,
            channel: channel.into(),
            camera: camera.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, \"{}\", {})",
            self.timepoint, self.z_index, self.channel, self.camera
        )
    }
}

/// Metadata a camera adapter attaches to a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Time of exposure end relative to experiment start
    #[serde(with = "humantime_serde")]
    pub timestamp: Duration,
    /// Measured exposure
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Stage position reported by the adapter, if it knows it
    pub stage_position: Option<f64>,
    /// Excitation wavelength reported by the adapter, if it knows it
    pub wavelength_nm: Option<f64>,
}

/// A frame pushed by a camera adapter.
///
/// Ownership moves from the adapter into the intake on arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    /// Camera that produced the frame
    pub camera_id: DeviceId,
    /// Zero-based index of the frame since the camera was armed
    pub frame_index: u64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel data, row-major
    pub pixels: Vec<u16>,
    /// Adapter-supplied metadata
    pub metadata: FrameMetadata,
}

impl ImageFrame {
    /// Create a frame with default metadata.
    pub fn new(
        camera_id: impl Into<DeviceId>,
        frame_index: u64,
        width: u32,
        height: u32,
        pixels: Vec<u16>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            frame_index,
            width,
            height,
            pixels,
            metadata: FrameMetadata::default(),
        }
    }

    /// Attach adapter metadata.
    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Size of the pixel payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<u16>()
    }
}

/// A slot the intake expects to be filled, in acquisition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSlot {
    /// Slot identity
    pub key: SlotKey,
    /// Index of the frame the slot's camera will produce for it
    pub camera_frame_index: u64,
    /// Trigger time relative to experiment start
    #[serde(with = "humantime_serde")]
    pub expected_at: Duration,
    /// Z stage position for the slot (None when no stage participates)
    pub stage_position: Option<f64>,
    /// Excitation wavelength (None for ambient light)
    pub wavelength_nm: Option<f64>,
    /// Exposure window length
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
}

/// Outcome of one plane in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaneStatus {
    /// Pixel data was written
    Written,
    /// The frame did not arrive within the timeout
    Missing,
    /// The run ended before the slot was triggered
    NotAcquired,
}

/// Metadata recorded for every plane, in acquisition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaneMetadata {
    /// Slot identity
    pub slot: SlotKey,
    /// Plane outcome
    pub status: PlaneStatus,
    /// Z stage position
    pub stage_position: Option<f64>,
    /// Excitation wavelength
    pub wavelength_nm: Option<f64>,
    /// Exposure
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Elapsed experiment time when the frame was captured (None if no frame)
    #[serde(with = "humantime_serde")]
    pub elapsed: Option<Duration>,
    /// Trigger time the slot was scheduled for
    #[serde(with = "humantime_serde")]
    pub expected_at: Duration,
    /// Byte offset of the plane's pixels in the data file (None if no frame)
    pub data_offset: Option<u64>,
}

impl PlaneMetadata {
    /// Metadata for a slot before any frame has been matched to it.
    pub fn pending(slot: &AcquisitionSlot, status: PlaneStatus) -> Self {
        Self {
            slot: slot.key.clone(),
            status,
            stage_position: slot.stage_position,
            wavelength_nm: slot.wavelength_nm,
            exposure: slot.exposure,
            elapsed: None,
            expected_at: slot.expected_at,
            data_offset: None,
        }
    }

    /// Metadata for a slot filled by `frame`. Adapter-reported values win over planned ones.
    pub fn written(slot: &AcquisitionSlot, frame: &ImageFrame) -> Self {
        Self {
            slot: slot.key.clone(),
            status: PlaneStatus::Written,
            stage_position: frame.metadata.stage_position.or(slot.stage_position),
            wavelength_nm: frame.metadata.wavelength_nm.or(slot.wavelength_nm),
            exposure: if frame.metadata.exposure.is_zero() {
                slot.exposure
            } else {
                frame.metadata.exposure
            },
            elapsed: Some(frame.metadata.timestamp),
            expected_at: slot.expected_at,
            data_offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> AcquisitionSlot {
        AcquisitionSlot {
            key: SlotKey::new(0, 1, "488", "cam_a"),
            camera_frame_index: 1,
            expected_at: Duration::from_millis(110),
            stage_position: Some(1.0),
            wavelength_nm: Some(488.0),
            exposure: Duration::from_millis(50),
        }
    }

    #[test]
    fn slot_key_display() {
        assert_eq!(
            SlotKey::new(0, 1, "488", "cam_a").to_string(),
            "(0, 1, \"488\", cam_a)"
        );
    }

    #[test]
    fn slot_keys_order_by_timepoint_then_z() {
        let a = SlotKey::new(0, 2, "561", "cam_a");
        let b = SlotKey::new(1, 0, "488", "cam_a");
        assert!(a < b);
    }

    #[test]
    fn written_metadata_prefers_adapter_values() {
        let frame = ImageFrame::new("cam_a", 1, 2, 2, vec![0; 4]).with_metadata(FrameMetadata {
            timestamp: Duration::from_millis(160),
            exposure: Duration::from_millis(49),
            stage_position: None,
            wavelength_nm: Some(490.0),
        });
        let meta = PlaneMetadata::written(&slot(), &frame);
        assert_eq!(meta.status, PlaneStatus::Written);
        assert_eq!(meta.stage_position, Some(1.0));
        assert_eq!(meta.wavelength_nm, Some(490.0));
        assert_eq!(meta.exposure, Duration::from_millis(49));
        assert_eq!(meta.elapsed, Some(Duration::from_millis(160)));
        assert_eq!(frame.byte_len(), 8);
    }

    #[test]
    fn pending_metadata_has_no_elapsed_time() {
        let meta = PlaneMetadata::pending(&slot(), PlaneStatus::Missing);
        assert_eq!(meta.status, PlaneStatus::Missing);
        assert!(meta.elapsed.is_none());
        assert!(meta.data_offset.is_none());
    }
}

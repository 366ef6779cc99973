//! Custom error types for the experiment engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate. Using the
//! `thiserror` crate, it gives every failure the engine can surface a single, matchable shape,
//! from unsatisfiable experiment requests to a timing executor dropping off the bus mid-run.
//!
//! ## Error Taxonomy
//!
//! - **`InvalidSpec`**: the requested timings cannot be achieved by the participating devices
//!   (exposure below a camera minimum, Z step below the stage resolution, a missing device).
//!   Raised by the action table builder before any hardware is touched.
//! - **`Preparation`**: a device refused to arm. Recoverable; the engine returns to `Idle`.
//! - **`ConnectionLost`**: the timing executor stopped answering. Fatal for the run; the engine
//!   aborts and never resumes a partially executed table.
//! - **`Busy`**: a start request arrived while another run was not `Idle`.
//! - **`Compile`**: the action table could not be turned into an executor profile.
//!
//! Missing frames are deliberately *not* an error: they are recorded as
//! [`MissingFrameWarning`]s in the run result and the run carries on.
//!
//! Device capability traits return `anyhow::Result`; the engine converts those failures into
//! `DaqError` at the boundary where it knows which device and which phase was involved.

use crate::data::frame::SlotKey;
use crate::experiment::executor::TableHandle;
use crate::experiment::state::ExperimentState;
use crate::hardware::registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the experiment engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The experiment description cannot be executed with the configured devices.
    #[error("Invalid experiment spec: {0}")]
    InvalidSpec(String),

    /// A participating device refused to enter armed mode.
    #[error("Device '{device}' refused to arm: {reason}")]
    Preparation {
        /// Device that rejected arming
        device: DeviceId,
        /// Reason reported by the device adapter
        reason: String,
    },

    /// The timing executor connection dropped.
    #[error("Connection to timing executor lost: {0}")]
    ConnectionLost(String),

    /// A run is already in progress.
    #[error("Experiment engine is busy (state: {state})")]
    Busy {
        /// State of the run that blocked the request
        state: ExperimentState,
    },

    /// The action table could not be compiled for the executor.
    #[error("Timing compilation failed: {0}")]
    Compile(String),

    /// The executor rejected an operation.
    #[error("Executor error: {0}")]
    Executor(String),

    /// The handle does not refer to the table currently held by the executor client.
    #[error("Unknown table handle: {0}")]
    UnknownHandle(TableHandle),

    /// Output file handling failed.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Semantic configuration problem found during validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Append `context` to the message. Message-carrying variants keep their kind; anything
    /// else is reported as an executor error.
    pub fn with_context(self, context: impl std::fmt::Display) -> Self {
        match self {
            DaqError::ConnectionLost(m) => DaqError::ConnectionLost(format!("{}; {}", m, context)),
            DaqError::Compile(m) => DaqError::Compile(format!("{}; {}", m, context)),
            DaqError::Executor(m) => DaqError::Executor(format!("{}; {}", m, context)),
            DaqError::Storage(m) => DaqError::Storage(format!("{}; {}", m, context)),
            other => DaqError::Executor(format!("{}; {}", other, context)),
        }
    }

    /// Whether the engine can stay usable after this error without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidSpec(_) | DaqError::Preparation { .. } | DaqError::Busy { .. }
        )
    }
}

/// A slot whose frame never arrived within the intake timeout.
///
/// Non-fatal: collected into the run result so the count is never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingFrameWarning {
    /// Slot that was not filled
    pub slot: SlotKey,
    /// Trigger time of the slot, relative to experiment start
    #[serde(with = "humantime_serde")]
    pub expected_at: Duration,
}

impl std::fmt::Display for MissingFrameWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "missing frame for slot {} (expected at {:.6}s)",
            self.slot,
            self.expected_at.as_secs_f64()
        )
    }
}

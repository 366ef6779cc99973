//! Experiment state and run archiving.
//!
//! This module provides the lifecycle states the experiment engine moves through and the
//! [`RunRecord`] written to disk when a run returns to `Idle`.

use super::run_engine::RunResult;
use super::spec::ExperimentSpec;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Experiment lifecycle state.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Preparing ──armed + uploaded──> Running ──completed──> Completing ──> Idle
///                     │                              │
///               arm refused                abort / fault / lost link
///                     │                              │
///                     ▼                              ▼
///                   Idle                         Aborting ───────────────────────────> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentState {
    /// No run active
    Idle,
    /// Building the table, arming devices, uploading
    Preparing,
    /// Executor playing the table
    Running,
    /// Table finished; devices disarming and intake flushing
    Completing,
    /// Run stopped early; outputs idling, devices disarming and intake flushing
    Aborting,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Preparing => write!(f, "Preparing"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Completing => write!(f, "Completing"),
            ExperimentState::Aborting => write!(f, "Aborting"),
        }
    }
}

impl ExperimentState {
    /// Check if the state allows starting a new run.
    pub fn can_start(&self) -> bool {
        matches!(self, ExperimentState::Idle)
    }

    /// Check if the state accepts an abort request.
    pub fn can_abort(&self) -> bool {
        matches!(self, ExperimentState::Preparing | ExperimentState::Running)
    }

    /// Whether a run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, ExperimentState::Idle)
    }

    /// Check if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ExperimentState) -> bool {
        use ExperimentState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Running)
                | (Preparing, Idle)
                | (Running, Completing)
                | (Running, Aborting)
                | (Completing, Idle)
                | (Aborting, Idle)
        )
    }
}

/// One state change with its time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ExperimentState,
    /// New state
    pub to: ExperimentState,
    /// When the change happened
    pub at: DateTime<Utc>,
}

/// Archived run: what was asked for, how the state machine moved, and what came out.
///
/// Records are serialized to JSON and saved next to the run's output, one file per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier
    pub run_id: String,
    /// Start request time
    pub started_at: DateTime<Utc>,
    /// Return to Idle
    pub finished_at: DateTime<Utc>,
    /// Spec the run executed
    pub spec: ExperimentSpec,
    /// State changes in order
    pub history: Vec<StateTransition>,
    /// Run outcome
    pub result: RunResult,
}

impl RunRecord {
    /// Save record to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Serialization fails
    /// - File write fails
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run record")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create run archive directory")?;
        }

        fs::write(&path, json)
            .with_context(|| format!("Failed to write run record to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load record from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run record from {:?}", path.as_ref()))?;

        let record = serde_json::from_str(&json).context("Failed to deserialize run record")?;

        Ok(record)
    }

    /// Default archive path: `<dir>/runs/<run_id>.json`.
    pub fn default_path(dir: &Path, run_id: &str) -> PathBuf {
        dir.join("runs").join(format!("{}.json", run_id))
    }
}

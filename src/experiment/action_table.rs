//! Timed action tables.
//!
//! An [`ActionTable`] is the ordered list of everything the timing executor will do during one
//! pass of an experiment: line changes, camera and light pulses, and stage moves. Tables are
//! validated on construction and immutable afterwards; the executor client shares them behind an
//! `Arc` so nothing can change a table once it has been uploaded.
//!
//! # Ordering
//!
//! Entries are sorted by timestamp. Entries on different targets may share a timestamp; ties are
//! broken by [`ActionKind::tie_break_rank`] (digital lines, then analog lines, then camera
//! triggers) and finally by insertion order, so the same input always yields the same table.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DigitalLine;
use crate::hardware::registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::time::Duration;

/// What an entry does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Drive a digital line high or low
    DigitalSet,
    /// Drive an analog line to a level
    AnalogSet,
    /// Pulse a camera's trigger line for the exposure window
    CameraTrigger,
    /// Pulse a light source's enable line
    LightTrigger,
    /// Move a stage axis through its analog line
    StageMove,
}

impl ActionKind {
    /// Order among entries that share a timestamp (lower fires first).
    ///
    /// Light triggers are digital lines and stage moves are analog lines, so they share the
    /// rank of the line kind they drive.
    pub fn tie_break_rank(self) -> u8 {
        match self {
            ActionKind::DigitalSet | ActionKind::LightTrigger => 0,
            ActionKind::AnalogSet | ActionKind::StageMove => 1,
            ActionKind::CameraTrigger => 2,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::DigitalSet => "digital-set",
            ActionKind::AnalogSet => "analog-set",
            ActionKind::CameraTrigger => "camera-trigger",
            ActionKind::LightTrigger => "light-trigger",
            ActionKind::StageMove => "stage-move",
        };
        f.write_str(name)
    }
}

/// What an entry acts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHandle {
    /// A raw digital output line
    Digital(DigitalLine),
    /// A raw analog output line
    Analog(u8),
    /// A device role, resolved to its line by the compiler
    Device(DeviceId),
}

impl fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetHandle::Digital(line) => write!(f, "do{}", line.0),
            TargetHandle::Analog(line) => write!(f, "ao{}", line),
            TargetHandle::Device(id) => f.write_str(id),
        }
    }
}

/// Value carried by an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Digital level
    Digital(bool),
    /// Raw analog level
    Analog(f64),
    /// Stage position in device units
    Position(f64),
    /// High pulse of the given length
    Pulse(#[serde(with = "humantime_serde")] Duration),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Digital(level) => write!(f, "{}", if *level { "high" } else { "low" }),
            Payload::Analog(level) => write!(f, "{:.4}", level),
            Payload::Position(pos) => write!(f, "-> {:.4}", pos),
            Payload::Pulse(width) => write!(f, "pulse {:.3} ms", width.as_secs_f64() * 1e3),
        }
    }
}

/// One timed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Offset from the start of the table pass
    #[serde(with = "humantime_serde")]
    pub timestamp: Duration,
    /// Line or device acted on
    pub target: TargetHandle,
    /// Kind of action
    pub kind: ActionKind,
    /// Value
    pub payload: Payload,
}

impl ActionEntry {
    /// Create an entry.
    pub fn new(timestamp: Duration, target: TargetHandle, kind: ActionKind, payload: Payload) -> Self {
        Self {
            timestamp,
            target,
            kind,
            payload,
        }
    }

    /// Time at which the entry stops affecting its target (end of a pulse).
    pub fn end_time(&self) -> Duration {
        match self.payload {
            Payload::Pulse(width) => self.timestamp + width,
            _ => self.timestamp,
        }
    }

    fn check_shape(&self) -> AppResult<()> {
        let ok = match (self.kind, &self.target, &self.payload) {
            (ActionKind::DigitalSet, TargetHandle::Digital(_) | TargetHandle::Device(_), Payload::Digital(_)) => true,
            (ActionKind::AnalogSet, TargetHandle::Analog(_), Payload::Analog(_)) => true,
            (ActionKind::CameraTrigger | ActionKind::LightTrigger, TargetHandle::Device(_), Payload::Pulse(w)) => {
                !w.is_zero()
            }
            (ActionKind::StageMove, TargetHandle::Device(_), Payload::Position(p)) => p.is_finite(),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(DaqError::InvalidSpec(format!(
                "Malformed {} entry for {} at {:?}: payload {}",
                self.kind, self.target, self.timestamp, self.payload
            )))
        }
    }
}

/// Validated, immutable, ordered table of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTable {
    entries: Vec<ActionEntry>,
    #[serde(with = "humantime_serde")]
    total_duration: Duration,
    repeat_count: u32,
}

impl ActionTable {
    /// Sort and validate `entries` into a table.
    ///
    /// # Errors
    /// `DaqError::InvalidSpec` if
    /// - `repeat_count` is zero or `total_duration` is zero
    /// - an entry's kind, target and payload do not fit together
    /// - an entry (including the tail of a pulse) runs past `total_duration`
    /// - two entries for the same target share a timestamp
    pub fn new(
        entries: Vec<ActionEntry>,
        total_duration: Duration,
        repeat_count: u32,
    ) -> AppResult<Self> {
        if repeat_count == 0 {
            return Err(DaqError::InvalidSpec(
                "repeat count must be at least 1".to_string(),
            ));
        }
        if total_duration.is_zero() {
            return Err(DaqError::InvalidSpec(
                "table duration must be positive".to_string(),
            ));
        }

        let mut entries = entries;
        // stable: insertion order settles ties of equal rank
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.kind.tie_break_rank().cmp(&b.kind.tie_break_rank()))
        });

        let mut last_by_target: HashMap<&TargetHandle, Duration> = HashMap::new();
        for entry in &entries {
            entry.check_shape()?;
            if entry.end_time() > total_duration {
                return Err(DaqError::InvalidSpec(format!(
                    "{} entry for {} ends at {:?}, past table duration {:?}",
                    entry.kind,
                    entry.target,
                    entry.end_time(),
                    total_duration
                )));
            }
            if let Some(previous) = last_by_target.insert(&entry.target, entry.timestamp) {
                if previous == entry.timestamp {
                    return Err(DaqError::InvalidSpec(format!(
                        "two entries for {} at {:?}",
                        entry.target, entry.timestamp
                    )));
                }
            }
        }

        Ok(Self {
            entries,
            total_duration,
            repeat_count,
        })
    }

    /// Entries in execution order.
    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    /// Number of entries in one pass.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of one pass.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Number of passes the executor plays.
    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    /// Entries executed over all passes.
    pub fn total_entries(&self) -> u64 {
        self.entries.len() as u64 * u64::from(self.repeat_count)
    }

    /// Latest entry acting on `target`.
    pub fn last_action_for(&self, target: &TargetHandle) -> Option<&ActionEntry> {
        self.entries.iter().rev().find(|e| &e.target == target)
    }

    /// Start of the first entry and end of the last-finishing entry.
    pub fn first_and_last_times(&self) -> Option<(Duration, Duration)> {
        let first = self.entries.first()?.timestamp;
        let last = self.entries.iter().map(ActionEntry::end_time).max()?;
        Some((first, last))
    }

    /// Camera triggers in one pass, optionally for a single camera.
    pub fn camera_trigger_count(&self, camera: Option<&str>) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == ActionKind::CameraTrigger)
            .filter(|e| match (camera, &e.target) {
                (None, _) => true,
                (Some(id), TargetHandle::Device(target)) => target == id,
                _ => false,
            })
            .count()
    }

    /// Human-readable listing, optionally restricted to one target.
    pub fn pretty_string(&self, filter: Option<&TargetHandle>) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# {} entries, {:.3} ms per pass, {} pass(es)",
            self.entries.len(),
            self.total_duration.as_secs_f64() * 1e3,
            self.repeat_count
        );
        for entry in self
            .entries
            .iter()
            .filter(|e| filter.map_or(true, |t| &e.target == t))
        {
            let _ = writeln!(
                out,
                "{:>12.4} ms  {:<16} {:<15} {}",
                entry.timestamp.as_secs_f64() * 1e3,
                entry.target.to_string(),
                entry.kind.to_string(),
                entry.payload
            );
        }
        out
    }
}

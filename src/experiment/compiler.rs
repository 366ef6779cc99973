//! Timing compiler.
//!
//! Turns an [`ActionTable`] into the representation a clocked timing executor plays:
//! digital output words and per-line analog levels, each stamped with an integer clock tick.
//!
//! 1. Every entry is resolved to the physical line(s) it drives. Pulses become a rising and a
//!    falling edge; stage moves become analog levels through the stage's scaling.
//! 2. Timestamps are quantised to ticks by rounding to the nearest tick.
//! 3. Edges on the same tick are applied in tie-break order and merged into one output row.
//!    Identical duplicates are dropped; different levels for one line on one tick are an error.
//! 4. A trailing row pads each pass to exactly the table duration, so repeats keep their period.

use crate::config::ExecutorConfig;
use crate::error::{AppResult, DaqError};
use crate::experiment::action_table::{ActionKind, ActionTable, Payload, TargetHandle};
use crate::hardware::capabilities::{AnalogLine, DigitalLine};
use crate::hardware::registry::{Capability, DeviceId, DeviceRegistry};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Digital output word from `tick` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalRow {
    /// Clock tick within the pass
    pub tick: u64,
    /// Output word, bit n = digital line n
    pub state: u32,
}

/// Analog output level from `tick` on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogPoint {
    /// Clock tick within the pass
    pub tick: u64,
    /// Output level
    pub level: f64,
}

/// All level changes of one analog line.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogTrack {
    /// Analog output index
    pub line: u8,
    /// Level changes in tick order
    pub points: Vec<AnalogPoint>,
}

/// One step of playback, digital and analog merged in tick order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineStep {
    /// Set the digital output word
    Digital {
        /// Tick within the pass
        tick: u64,
        /// Output word
        state: u32,
    },
    /// Set one analog output
    Analog {
        /// Tick within the pass
        tick: u64,
        /// Analog output index
        line: u8,
        /// Output level
        level: f64,
    },
}

impl TimelineStep {
    /// Tick of the step within its pass.
    pub fn tick(&self) -> u64 {
        match self {
            TimelineStep::Digital { tick, .. } | TimelineStep::Analog { tick, .. } => *tick,
        }
    }
}

/// Executor-native form of an action table.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProfile {
    /// Executor clock rate
    pub ticks_per_second: u64,
    /// Length of one pass in ticks
    pub duration_ticks: u64,
    /// Number of passes
    pub repeat_count: u32,
    /// Digital rows; the first is at tick 0 and the last at `duration_ticks`
    pub digital: Vec<DigitalRow>,
    /// Analog tracks by line
    pub analog: Vec<AnalogTrack>,
    /// Tick of every table entry, in table order
    pub entry_ticks: Vec<u64>,
}

impl CompiledProfile {
    /// Wall time of `tick` from the start of playback.
    pub fn tick_to_duration(&self, tick: u64) -> Duration {
        let nanos = u128::from(tick) * NANOS_PER_SECOND / u128::from(self.ticks_per_second.max(1));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Length of one pass.
    pub fn cycle_duration(&self) -> Duration {
        self.tick_to_duration(self.duration_ticks)
    }

    /// Digital rows and analog points of one pass in playback order.
    ///
    /// On a shared tick digital rows come first.
    pub fn timeline(&self) -> Vec<TimelineStep> {
        let mut steps: Vec<TimelineStep> = self
            .digital
            .iter()
            .map(|row| TimelineStep::Digital {
                tick: row.tick,
                state: row.state,
            })
            .collect();
        for track in &self.analog {
            steps.extend(track.points.iter().map(|p| TimelineStep::Analog {
                tick: p.tick,
                line: track.line,
                level: p.level,
            }));
        }
        steps.sort_by_key(TimelineStep::tick);
        steps
    }

    /// Table entries executed after `cycles` full passes plus the current pass up to `last_tick`.
    pub fn completed_entries(&self, cycles: u32, last_tick: Option<u64>) -> u64 {
        let per_cycle = self.entry_ticks.len() as u64;
        let partial = last_tick.map_or(0, |t| self.entry_ticks.partition_point(|&e| e <= t) as u64);
        (u64::from(cycles) * per_cycle + partial).min(per_cycle * u64::from(self.repeat_count))
    }
}

/// Physical wiring of a device role.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wiring {
    /// Device driven by a digital line (cameras, lights)
    Digital(DigitalLine),
    /// Device driven by an analog line (stages)
    Analog(AnalogLine),
}

/// Device id → line wiring, used to resolve `TargetHandle::Device`.
#[derive(Debug, Clone, Default)]
pub struct LineMap {
    devices: HashMap<DeviceId, Wiring>,
}

impl LineMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device's wiring.
    pub fn insert(&mut self, device: impl Into<DeviceId>, wiring: Wiring) {
        self.devices.insert(device.into(), wiring);
    }

    /// Wiring of every camera, light and stage in the registry.
    pub fn from_registry(registry: &DeviceRegistry) -> Self {
        let mut map = Self::new();
        for id in registry.devices_with_capability(Capability::Camera) {
            if let Some(camera) = registry.get_camera(&id) {
                map.insert(id, Wiring::Digital(camera.trigger_line()));
            }
        }
        for id in registry.devices_with_capability(Capability::LightSource) {
            if let Some(light) = registry.get_light(&id) {
                map.insert(id, Wiring::Digital(light.trigger_line()));
            }
        }
        for id in registry.devices_with_capability(Capability::StageAxis) {
            if let Some(stage) = registry.get_stage(&id) {
                map.insert(id, Wiring::Analog(stage.analog_line()));
            }
        }
        map
    }

    /// Wiring of `device`.
    pub fn get(&self, device: &str) -> Option<Wiring> {
        self.devices.get(device).copied()
    }
}

struct Edge {
    tick: u64,
    line: u8,
    level: bool,
    rank: u8,
    seq: usize,
}

/// Compiles action tables for one executor.
#[derive(Debug, Clone)]
pub struct TimingCompiler {
    ticks_per_second: u64,
    digital_lines: u8,
    analog_lines: u8,
    wiring: LineMap,
}

impl TimingCompiler {
    /// Compiler for the executor described by `config`.
    pub fn new(config: &ExecutorConfig, wiring: LineMap) -> Self {
        Self {
            ticks_per_second: config.ticks_per_second.max(1),
            digital_lines: config.digital_lines,
            analog_lines: config.analog_lines,
            wiring,
        }
    }

    /// Length of one clock tick.
    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos((NANOS_PER_SECOND / u128::from(self.ticks_per_second)).max(1) as u64)
    }

    /// Nearest tick to `offset`.
    pub fn to_ticks(&self, offset: Duration) -> u64 {
        let scaled = offset.as_nanos() * u128::from(self.ticks_per_second);
        let ticks = (scaled + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Compile `table`.
    ///
    /// # Errors
    /// `DaqError::Compile` when
    /// - a target cannot be resolved to a line, or the line is outside the executor's range
    /// - a pulse is shorter than one tick, or two pulses on one line overlap
    /// - one line receives different levels on the same tick
    pub fn compile(&self, table: &ActionTable) -> AppResult<CompiledProfile> {
        let duration_ticks = self.to_ticks(table.total_duration());
        if duration_ticks == 0 {
            return Err(DaqError::Compile(format!(
                "table duration {:?} is shorter than one clock tick",
                table.total_duration()
            )));
        }

        let mut entry_ticks = Vec::with_capacity(table.len());
        let mut edges: Vec<Edge> = Vec::new();
        let mut pulses: BTreeMap<u8, Vec<(u64, u64)>> = BTreeMap::new();
        let mut analog: BTreeMap<u8, Vec<(u64, usize, f64)>> = BTreeMap::new();

        for (seq, entry) in table.entries().iter().enumerate() {
            let tick = self.to_ticks(entry.timestamp);
            entry_ticks.push(tick);
            let rank = entry.kind.tie_break_rank();

            match (entry.kind, &entry.payload) {
                (ActionKind::DigitalSet, Payload::Digital(level)) => {
                    let line = self.digital_line(&entry.target)?;
                    edges.push(Edge {
                        tick,
                        line: line.0,
                        level: *level,
                        rank,
                        seq,
                    });
                }
                (ActionKind::CameraTrigger | ActionKind::LightTrigger, Payload::Pulse(width)) => {
                    let line = self.digital_line(&entry.target)?;
                    let end = self.to_ticks(entry.timestamp + *width);
                    if end <= tick {
                        return Err(DaqError::Compile(format!(
                            "{} pulse for {} at {:?} is shorter than one clock tick",
                            entry.kind, entry.target, entry.timestamp
                        )));
                    }
                    edges.push(Edge {
                        tick,
                        line: line.0,
                        level: true,
                        rank,
                        seq,
                    });
                    edges.push(Edge {
                        tick: end,
                        line: line.0,
                        level: false,
                        rank,
                        seq,
                    });
                    pulses.entry(line.0).or_default().push((tick, end));
                }
                (ActionKind::AnalogSet, Payload::Analog(level)) => {
                    let line = match entry.target {
                        TargetHandle::Analog(line) => line,
                        _ => return Err(self.unresolved(&entry.target)),
                    };
                    self.check_analog(line)?;
                    analog.entry(line).or_default().push((tick, seq, *level));
                }
                (ActionKind::StageMove, Payload::Position(position)) => {
                    let line = self.analog_line(&entry.target)?;
                    analog
                        .entry(line.line)
                        .or_default()
                        .push((tick, seq, line.level_for(*position)));
                }
                (kind, payload) => {
                    return Err(DaqError::Compile(format!(
                        "cannot compile {} with payload {}",
                        kind, payload
                    )))
                }
            }
        }

        for (line, spans) in &mut pulses {
            spans.sort_unstable();
            spans.dedup();
            for pair in spans.windows(2) {
                if pair[1].0 < pair[0].1 {
                    return Err(DaqError::Compile(format!(
                        "overlapping pulses on digital line {} at ticks {} and {}",
                        line, pair[0].0, pair[1].0
                    )));
                }
            }
        }

        let digital = self.digital_rows(edges, duration_ticks)?;
        let analog = analog
            .into_iter()
            .map(|(line, points)| Self::analog_track(line, points))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(CompiledProfile {
            ticks_per_second: self.ticks_per_second,
            duration_ticks,
            repeat_count: table.repeat_count(),
            digital,
            analog,
            entry_ticks,
        })
    }

    fn digital_rows(&self, mut edges: Vec<Edge>, duration_ticks: u64) -> AppResult<Vec<DigitalRow>> {
        edges.sort_by_key(|e| (e.tick, e.rank, e.seq));

        let mut rows = vec![DigitalRow { tick: 0, state: 0 }];
        let mut state = 0u32;
        let mut i = 0;
        while i < edges.len() {
            let tick = edges[i].tick;
            if tick > duration_ticks {
                return Err(DaqError::Compile(format!(
                    "edge at tick {} past pass length {}",
                    tick, duration_ticks
                )));
            }
            let mut assigned = 0u32;
            let mut levels = 0u32;
            while i < edges.len() && edges[i].tick == tick {
                let bit = 1u32 << edges[i].line;
                let high = edges[i].level;
                if assigned & bit != 0 {
                    if (levels & bit != 0) != high {
                        return Err(DaqError::Compile(format!(
                            "conflicting levels for digital line {} at tick {}",
                            edges[i].line, tick
                        )));
                    }
                } else {
                    assigned |= bit;
                    if high {
                        levels |= bit;
                    }
                }
                i += 1;
            }

            let next = (state & !assigned) | levels;
            if tick == 0 {
                rows[0].state = next;
            } else if next != state {
                rows.push(DigitalRow { tick, state: next });
            }
            state = next;
        }

        let last_tick = rows.last().map_or(0, |r| r.tick);
        if last_tick < duration_ticks {
            rows.push(DigitalRow {
                tick: duration_ticks,
                state,
            });
        }
        Ok(rows)
    }

    fn analog_track(line: u8, mut points: Vec<(u64, usize, f64)>) -> AppResult<AnalogTrack> {
        points.sort_by_key(|p| (p.0, p.1));
        let mut merged: Vec<AnalogPoint> = Vec::with_capacity(points.len());
        for (tick, _, level) in points {
            match merged.last() {
                Some(last) if last.tick == tick => {
                    if (last.level - level).abs() > f64::EPSILON * last.level.abs().max(1.0) {
                        return Err(DaqError::Compile(format!(
                            "conflicting levels for analog line {} at tick {}",
                            line, tick
                        )));
                    }
                }
                _ => merged.push(AnalogPoint { tick, level }),
            }
        }
        Ok(AnalogTrack {
            line,
            points: merged,
        })
    }

    fn digital_line(&self, target: &TargetHandle) -> AppResult<DigitalLine> {
        let line = match target {
            TargetHandle::Digital(line) => *line,
            TargetHandle::Device(id) => match self.wiring.get(id) {
                Some(Wiring::Digital(line)) => line,
                _ => return Err(self.unresolved(target)),
            },
            TargetHandle::Analog(_) => return Err(self.unresolved(target)),
        };
        if line.0 >= self.digital_lines {
            return Err(DaqError::Compile(format!(
                "digital line {} outside executor range (0-{})",
                line.0,
                self.digital_lines.saturating_sub(1)
            )));
        }
        Ok(line)
    }

    fn analog_line(&self, target: &TargetHandle) -> AppResult<AnalogLine> {
        match target {
            TargetHandle::Device(id) => match self.wiring.get(id) {
                Some(Wiring::Analog(line)) => {
                    self.check_analog(line.line)?;
                    Ok(line)
                }
                _ => Err(self.unresolved(target)),
            },
            _ => Err(self.unresolved(target)),
        }
    }

    fn check_analog(&self, line: u8) -> AppResult<()> {
        if line >= self.analog_lines {
            return Err(DaqError::Compile(format!(
                "analog line {} outside executor range (0-{})",
                line,
                self.analog_lines.saturating_sub(1)
            )));
        }
        Ok(())
    }

    fn unresolved(&self, target: &TargetHandle) -> DaqError {
        DaqError::Compile(format!("no output line wired for target {}", target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::action_table::ActionEntry;

    fn us(v: u64) -> Duration {
        Duration::from_micros(v)
    }

    fn compiler() -> TimingCompiler {
        let mut wiring = LineMap::new();
        wiring.insert("cam_a", Wiring::Digital(DigitalLine(0)));
        wiring.insert("cam_b", Wiring::Digital(DigitalLine(0)));
        wiring.insert("laser", Wiring::Digital(DigitalLine(1)));
        wiring.insert(
            "stage_z",
            Wiring::Analog(AnalogLine {
                line: 0,
                gain: 0.5,
                offset: 2.0,
            }),
        );
        TimingCompiler::new(&ExecutorConfig::default(), wiring)
    }

    fn pulse(at: Duration, device: &str, kind: ActionKind, width: Duration) -> ActionEntry {
        ActionEntry::new(at, TargetHandle::Device(device.into()), kind, Payload::Pulse(width))
    }

    #[test]
    fn rounds_to_nearest_tick() {
        let c = compiler();
        assert_eq!(c.tick_period(), us(10));
        assert_eq!(c.to_ticks(us(14)), 1);
        assert_eq!(c.to_ticks(us(15)), 2);
        assert_eq!(c.to_ticks(Duration::from_millis(1)), 100);
    }

    #[test]
    fn pulses_become_rows_padded_to_duration() {
        let table = ActionTable::new(
            vec![
                pulse(us(100), "cam_a", ActionKind::CameraTrigger, us(500)),
                pulse(us(200), "laser", ActionKind::LightTrigger, us(300)),
            ],
            Duration::from_millis(2),
            1,
        )
        .unwrap();
        let profile = compiler().compile(&table).unwrap();

        assert_eq!(profile.duration_ticks, 200);
        assert_eq!(
            profile.digital,
            vec![
                DigitalRow { tick: 0, state: 0 },
                DigitalRow { tick: 10, state: 0b01 },
                DigitalRow { tick: 20, state: 0b11 },
                DigitalRow { tick: 50, state: 0b01 },
                DigitalRow { tick: 60, state: 0b00 },
                DigitalRow { tick: 200, state: 0b00 },
            ]
        );
        assert_eq!(profile.entry_ticks, vec![10, 20]);
        assert_eq!(profile.cycle_duration(), Duration::from_millis(2));
    }

    #[test]
    fn stage_moves_use_analog_scaling() {
        let table = ActionTable::new(
            vec![ActionEntry::new(
                us(0),
                TargetHandle::Device("stage_z".into()),
                ActionKind::StageMove,
                Payload::Position(4.0),
            )],
            Duration::from_millis(1),
            1,
        )
        .unwrap();
        let profile = compiler().compile(&table).unwrap();
        assert_eq!(profile.analog.len(), 1);
        assert_eq!(profile.analog[0].points, vec![AnalogPoint { tick: 0, level: 3.0 }]);
        assert!(profile.digital.len() >= 2);
    }

    #[test]
    fn identical_same_tick_edges_merge() {
        // two cameras wired to one trigger line fire together
        let table = ActionTable::new(
            vec![
                pulse(us(100), "cam_a", ActionKind::CameraTrigger, us(100)),
                pulse(us(100), "cam_b", ActionKind::CameraTrigger, us(100)),
            ],
            Duration::from_millis(1),
            1,
        )
        .unwrap();
        let profile = compiler().compile(&table).unwrap();
        assert_eq!(profile.digital.len(), 4);
    }

    #[test]
    fn conflicting_same_tick_levels_fail() {
        let table = ActionTable::new(
            vec![
                pulse(us(100), "cam_a", ActionKind::CameraTrigger, us(100)),
                // rising edge lands on the tick where cam_a's pulse falls
                pulse(us(201), "cam_b", ActionKind::CameraTrigger, us(100)),
            ],
            Duration::from_millis(1),
            1,
        )
        .unwrap();
        let err = compiler().compile(&table).unwrap_err();
        assert!(matches!(err, DaqError::Compile(_)));
    }

    #[test]
    fn overlapping_pulses_fail() {
        let table = ActionTable::new(
            vec![
                pulse(us(100), "cam_a", ActionKind::CameraTrigger, us(300)),
                pulse(us(200), "cam_b", ActionKind::CameraTrigger, us(300)),
            ],
            Duration::from_millis(1),
            1,
        )
        .unwrap();
        assert!(compiler().compile(&table).is_err());
    }

    #[test]
    fn sub_tick_pulse_fails() {
        let table = ActionTable::new(
            vec![pulse(us(100), "cam_a", ActionKind::CameraTrigger, us(2))],
            Duration::from_millis(1),
            1,
        )
        .unwrap();
        assert!(compiler().compile(&table).is_err());
    }

    #[test]
    fn unwired_device_fails() {
        let table = ActionTable::new(
            vec![pulse(us(100), "cam_x", ActionKind::CameraTrigger, us(100))],
            Duration::from_millis(1),
            1,
        )
        .unwrap();
        assert!(compiler().compile(&table).is_err());
    }

    #[test]
    fn completed_entries_span_repeats() {
        let table = ActionTable::new(
            vec![
                pulse(us(100), "cam_a", ActionKind::CameraTrigger, us(100)),
                pulse(us(500), "cam_a", ActionKind::CameraTrigger, us(100)),
            ],
            Duration::from_millis(1),
            3,
        )
        .unwrap();
        let profile = compiler().compile(&table).unwrap();
        assert_eq!(profile.completed_entries(0, None), 0);
        assert_eq!(profile.completed_entries(0, Some(10)), 1);
        assert_eq!(profile.completed_entries(1, Some(60)), 4);
        assert_eq!(profile.completed_entries(3, None), 6);
    }
}

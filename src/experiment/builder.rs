//! Action table builder.
//!
//! Turns an [`ExperimentSpec`] into an [`ActionTable`] plus the acquisition plan the data intake
//! uses to put frames back in order.
//!
//! # Acquisition order
//!
//! Timepoint outer, Z plane middle, channel inner; within a channel, cameras in declared order.
//! The slot list in [`BuiltExperiment::acquisition`] follows exactly this order.
//!
//! # Timing rules
//!
//! - A stage move is emitted at the current cursor whenever the plane position changes (and for
//!   the first plane of a pass). The next exposure cannot open before the move's
//!   `movement_time().total()` (motion plus settle) has elapsed.
//! - The camera window is the requested exposure, or the camera minimum when the channel opts
//!   into stretching. The light pulse keeps the requested exposure and is centred in the window.
//! - A camera's trigger line is busy until its window closes plus readout time plus the minimum
//!   separation, so channels sharing a camera are serialized, never interleaved.
//! - Light shutters open at the start of the pass and close [`SHUTTER_CLOSE_DELAY`] after the
//!   last action.

use crate::data::frame::{AcquisitionSlot, SlotKey};
use crate::error::{AppResult, DaqError};
use crate::experiment::action_table::{ActionEntry, ActionKind, ActionTable, Payload, TargetHandle};
use crate::experiment::spec::{ChannelSpec, ExperimentSpec};
use crate::hardware::capabilities::{Camera, DigitalLine, LightSource, StageAxis};
use crate::hardware::registry::{DeviceId, DeviceRegistry};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delay between the last action of a pass and closing the light shutters.
pub const SHUTTER_CLOSE_DELAY: Duration = Duration::from_millis(100);

/// Default gap between consecutive entries on one target.
pub const DEFAULT_MIN_SEPARATION: Duration = Duration::from_micros(1);

/// Output of [`ActionTableBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltExperiment {
    /// Table for one pass
    pub table: ActionTable,
    /// Slots of one pass, in acquisition order
    pub acquisition: Vec<AcquisitionSlot>,
    /// Frames each camera produces per pass
    pub frames_per_pass: HashMap<DeviceId, u64>,
    /// Devices that take part, in first-use order
    pub participants: Vec<DeviceId>,
    /// Stage axis moved by the table, if any
    pub stage: Option<DeviceId>,
}

impl BuiltExperiment {
    /// Slots over every pass of the table.
    ///
    /// Pass `r` shifts timepoints by `r * timepoints_per_pass`, trigger times by `r` table
    /// durations and frame indices by the frames the camera produced in earlier passes.
    pub fn all_slots(&self) -> Vec<AcquisitionSlot> {
        let passes = self.table.repeat_count();
        let timepoints_per_pass = self
            .acquisition
            .iter()
            .map(|s| s.key.timepoint + 1)
            .max()
            .unwrap_or(0);
        let duration = self.table.total_duration();

        let mut slots = Vec::with_capacity(self.acquisition.len() * passes as usize);
        for pass in 0..passes {
            for slot in &self.acquisition {
                let frames = self.frames_per_pass.get(&slot.key.camera).copied().unwrap_or(0);
                let mut slot = slot.clone();
                slot.key.timepoint += pass * timepoints_per_pass;
                slot.expected_at += duration * pass;
                slot.camera_frame_index += u64::from(pass) * frames;
                slots.push(slot);
            }
        }
        slots
    }
}

struct ResolvedChannel<'s> {
    spec: &'s ChannelSpec,
    cameras: Vec<(DeviceId, Arc<dyn Camera>)>,
    light: Option<Arc<dyn LightSource>>,
    window: Duration,
}

/// Builds action tables against the devices in a registry.
pub struct ActionTableBuilder<'r> {
    registry: &'r DeviceRegistry,
    min_separation: Duration,
    stage_origin: Option<f64>,
}

impl<'r> ActionTableBuilder<'r> {
    /// Builder resolving device ids against `registry`, with the default one-tick separation and
    /// no stage origin.
    pub fn new(registry: &'r DeviceRegistry) -> Self {
        Self {
            registry,
            min_separation: DEFAULT_MIN_SEPARATION,
            stage_origin: None,
        }
    }

    /// Gap kept between consecutive entries on one target (at least one executor tick).
    pub fn with_min_separation(mut self, separation: Duration) -> Self {
        self.min_separation = separation.max(DEFAULT_MIN_SEPARATION);
        self
    }

    /// Stage position before the run, used to time the first move.
    pub fn with_stage_origin(mut self, position: f64) -> Self {
        self.stage_origin = Some(position);
        self
    }

    /// Build the table for `spec`.
    ///
    /// # Errors
    /// `DaqError::InvalidSpec` when the experiment spec is empty or inconsistent, names a device the
    /// registry does not have in the needed role, asks for an exposure below a camera minimum
    /// without opting into stretching, asks for a Z step below the stage resolution, or declares
    /// a timepoint interval shorter than one timepoint's acquisition.
    pub fn build(&self, spec: &ExperimentSpec) -> AppResult<BuiltExperiment> {
        check_shape(spec)?;
        let channels = self.resolve_channels(spec)?;
        let stage = self.resolve_stage(spec)?;

        let sep = self.min_separation;
        let planes = spec.plane_count();
        let mut entries = Vec::new();
        let mut slots = Vec::new();
        let mut participants: Vec<DeviceId> = Vec::new();
        let mut frames: HashMap<DeviceId, u64> = HashMap::new();
        let mut line_ready: HashMap<u8, Duration> = HashMap::new();
        let mut cursor = Duration::ZERO;
        let mut stage_at: Option<f64> = None;

        for timepoint in 0..spec.timepoints {
            if let Some(interval) = spec.timepoint_interval {
                let start = interval * timepoint;
                if cursor > start {
                    return Err(DaqError::InvalidSpec(format!(
                        "timepoint interval {:?} is shorter than one timepoint ({:?} needed)",
                        interval,
                        cursor.saturating_sub(interval * timepoint.saturating_sub(1))
                    )));
                }
                cursor = start;
            }

            for z_index in 0..planes {
                let position = match (&stage, &spec.z_stack) {
                    (Some((_, _)), Some(stack)) => Some(stack.position(z_index)),
                    _ => None,
                };

                if let (Some((stage_id, axis)), Some(target)) = (&stage, position) {
                    if stage_at != Some(target) {
                        let travel = self.travel_time(axis.as_ref(), stage_at, target, spec);
                        entries.push(ActionEntry::new(
                            cursor,
                            TargetHandle::Device(stage_id.clone()),
                            ActionKind::StageMove,
                            Payload::Position(target),
                        ));
                        note_participant(&mut participants, stage_id);
                        debug!(z_index, position = target, at = ?cursor, ?travel, "Stage move");
                        cursor += travel.max(sep);
                        stage_at = Some(target);
                    }
                }

                for channel in &channels {
                    let mut open = cursor;
                    for (_, camera) in &channel.cameras {
                        if let Some(ready) = line_ready.get(&camera.trigger_line().0) {
                            open = open.max(*ready);
                        }
                    }

                    let light_wavelength = channel.light.as_ref().map(|l| l.wavelength_nm());
                    for (camera_id, camera) in &channel.cameras {
                        entries.push(ActionEntry::new(
                            open,
                            TargetHandle::Device(camera_id.clone()),
                            ActionKind::CameraTrigger,
                            Payload::Pulse(channel.window),
                        ));
                        note_participant(&mut participants, camera_id);
                        line_ready.insert(
                            camera.trigger_line().0,
                            open + channel.window + camera.readout_time() + sep,
                        );

                        let index = frames.entry(camera_id.clone()).or_insert(0);
                        slots.push(AcquisitionSlot {
                            key: SlotKey::new(timepoint, z_index, &channel.spec.name, camera_id.clone()),
                            camera_frame_index: *index,
                            expected_at: open,
                            stage_position: position,
                            wavelength_nm: light_wavelength,
                            exposure: channel.window,
                        });
                        *index += 1;
                    }

                    if let (Some(light_id), Some(_)) = (&channel.spec.light, &channel.light) {
                        let lead = (channel.window - channel.spec.exposure) / 2;
                        entries.push(ActionEntry::new(
                            open + lead,
                            TargetHandle::Device(light_id.clone()),
                            ActionKind::LightTrigger,
                            Payload::Pulse(channel.spec.exposure),
                        ));
                        note_participant(&mut participants, light_id);
                    }

                    cursor = open + channel.window + sep;
                }
            }

            if let Some(interval) = spec.timepoint_interval {
                let busy_until = line_ready.values().copied().fold(cursor, Duration::max);
                let next_start = interval * (timepoint + 1);
                if busy_until > next_start {
                    return Err(DaqError::InvalidSpec(format!(
                        "timepoint interval {:?} is shorter than one timepoint ({:?} needed)",
                        interval,
                        busy_until - interval * timepoint
                    )));
                }
            }
        }

        let last_end = entries
            .iter()
            .map(ActionEntry::end_time)
            .max()
            .unwrap_or(Duration::ZERO);
        let mut total = line_ready.values().copied().fold(cursor.max(last_end), Duration::max);
        if let Some(interval) = spec.timepoint_interval {
            total = total.max(interval * spec.timepoints);
        }

        // shutter opens go first so they lead every other rank-0 entry at time zero
        let shutters = shutter_lines(&channels);
        if !shutters.is_empty() {
            let close = last_end + SHUTTER_CLOSE_DELAY;
            let mut opens = Vec::with_capacity(shutters.len());
            for line in shutters {
                let target = TargetHandle::Digital(DigitalLine(line));
                opens.push(ActionEntry::new(
                    Duration::ZERO,
                    target.clone(),
                    ActionKind::DigitalSet,
                    Payload::Digital(true),
                ));
                entries.push(ActionEntry::new(close, target, ActionKind::DigitalSet, Payload::Digital(false)));
            }
            opens.append(&mut entries);
            entries = opens;
            total = total.max(close + sep);
        }

        let table = ActionTable::new(entries, total, spec.repeat_count)?;
        debug!(
            entries = table.len(),
            slots = slots.len(),
            duration = ?table.total_duration(),
            "Action table built"
        );

        Ok(BuiltExperiment {
            table,
            acquisition: slots,
            frames_per_pass: frames,
            participants,
            stage: stage.map(|(id, _)| id),
        })
    }

    /// Time from the previous position (or the pre-run position) to `target`.
    ///
    /// The first move of a pass must also cover the return from the last plane when the table
    /// is replayed.
    fn travel_time(
        &self,
        axis: &dyn StageAxis,
        from: Option<f64>,
        target: f64,
        spec: &ExperimentSpec,
    ) -> Duration {
        match from {
            Some(from) => axis.movement_time(from, target).total(),
            None => {
                let origin = self.stage_origin.unwrap_or(target);
                let mut travel = axis.movement_time(origin, target).total();
                if spec.repeat_count > 1 {
                    if let Some(stack) = &spec.z_stack {
                        let last = stack.position(spec.plane_count() - 1);
                        travel = travel.max(axis.movement_time(last, target).total());
                    }
                }
                travel
            }
        }
    }

    fn resolve_channels<'s>(&self, spec: &'s ExperimentSpec) -> AppResult<Vec<ResolvedChannel<'s>>> {
        spec.channels
            .iter()
            .map(|channel| {
                let mut cameras = Vec::with_capacity(channel.cameras.len());
                let mut min_exposure = Duration::ZERO;
                for id in &channel.cameras {
                    let camera = self.registry.get_camera(id).ok_or_else(|| {
                        DaqError::InvalidSpec(format!(
                            "channel '{}': '{}' is not a registered camera",
                            channel.name, id
                        ))
                    })?;
                    min_exposure = min_exposure.max(camera.min_exposure());
                    cameras.push((id.clone(), camera));
                }

                let light = match &channel.light {
                    Some(id) => Some(self.registry.get_light(id).ok_or_else(|| {
                        DaqError::InvalidSpec(format!(
                            "channel '{}': '{}' is not a registered light source",
                            channel.name, id
                        ))
                    })?),
                    None => None,
                };

                let window = if channel.exposure >= min_exposure {
                    channel.exposure
                } else if channel.stretch_to_camera_minimum {
                    min_exposure
                } else {
                    return Err(DaqError::InvalidSpec(format!(
                        "channel '{}': exposure {:?} is below the camera minimum {:?}",
                        channel.name, channel.exposure, min_exposure
                    )));
                };

                Ok(ResolvedChannel {
                    spec: channel,
                    cameras,
                    light,
                    window,
                })
            })
            .collect()
    }

    fn resolve_stage(&self, spec: &ExperimentSpec) -> AppResult<Option<(DeviceId, Arc<dyn StageAxis>)>> {
        let Some(stack) = spec.z_stack.as_ref().filter(|s| s.slices > 0) else {
            return Ok(None);
        };
        let axis = self.registry.get_stage(&stack.stage).ok_or_else(|| {
            DaqError::InvalidSpec(format!("'{}' is not a registered stage axis", stack.stage))
        })?;
        if !stack.start.is_finite() || !stack.step.is_finite() {
            return Err(DaqError::InvalidSpec("Z stack positions must be finite".to_string()));
        }
        if stack.slices > 1 && stack.step.abs() < axis.min_step() {
            return Err(DaqError::InvalidSpec(format!(
                "Z step {} is below the minimum step {} of '{}'",
                stack.step,
                axis.min_step(),
                stack.stage
            )));
        }
        Ok(Some((stack.stage.clone(), axis)))
    }
}

fn check_shape(spec: &ExperimentSpec) -> AppResult<()> {
    if spec.timepoints == 0 {
        return Err(DaqError::InvalidSpec("at least one timepoint is required".to_string()));
    }
    if spec.repeat_count == 0 {
        return Err(DaqError::InvalidSpec("repeat count must be at least 1".to_string()));
    }
    if spec.channels.is_empty() {
        return Err(DaqError::InvalidSpec("at least one channel is required".to_string()));
    }
    if spec.timepoint_interval.is_some_and(|i| i.is_zero()) {
        return Err(DaqError::InvalidSpec("timepoint interval must be positive".to_string()));
    }

    let mut names = HashSet::new();
    for channel in &spec.channels {
        if !names.insert(channel.name.as_str()) {
            return Err(DaqError::InvalidSpec(format!("duplicate channel '{}'", channel.name)));
        }
        if channel.cameras.is_empty() {
            return Err(DaqError::InvalidSpec(format!("channel '{}' has no camera", channel.name)));
        }
        let unique: HashSet<_> = channel.cameras.iter().collect();
        if unique.len() != channel.cameras.len() {
            return Err(DaqError::InvalidSpec(format!(
                "channel '{}' lists a camera twice",
                channel.name
            )));
        }
        if channel.exposure.is_zero() {
            return Err(DaqError::InvalidSpec(format!(
                "channel '{}' has a zero exposure",
                channel.name
            )));
        }
    }
    Ok(())
}

fn note_participant(participants: &mut Vec<DeviceId>, id: &DeviceId) {
    if !participants.contains(id) {
        participants.push(id.clone());
    }
}

fn shutter_lines(channels: &[ResolvedChannel<'_>]) -> BTreeSet<u8> {
    channels
        .iter()
        .filter_map(|c| c.light.as_ref())
        .filter_map(|light| light.shutter_line())
        .map(|line| line.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::events::EventBus;
    use crate::experiment::spec::ZStack;
    use crate::hardware::mock::{MockCamera, MockExecutor, MockLight, MockStage};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn registry() -> DeviceRegistry {
        let executor = Arc::new(MockExecutor::new(&ExecutorConfig::default()));
        let bus = executor.line_bus();
        let mut registry = DeviceRegistry::new(EventBus::default());
        registry.set_mock_executor(executor);
        registry
            .register_camera(
                "cam_a",
                Arc::new(MockCamera::new("cam_a", DigitalLine(0), bus.clone()).with_min_exposure(ms(10))),
            )
            .unwrap();
        registry
            .register_camera(
                "cam_b",
                Arc::new(
                    MockCamera::new("cam_b", DigitalLine(3), bus.clone())
                        .with_readout_time(ms(20)),
                ),
            )
            .unwrap();
        registry
            .register_light(
                "laser_488",
                Arc::new(MockLight::new("laser_488", DigitalLine(1), 488.0, bus.clone()).with_shutter(DigitalLine(2))),
            )
            .unwrap();
        registry
            .register_light("laser_561", Arc::new(MockLight::new("laser_561", DigitalLine(4), 561.0, bus.clone())))
            .unwrap();
        registry
            .register_stage(
                "stage_z",
                Arc::new(
                    MockStage::new("stage_z", 0, bus)
                        .with_movement_time(ms(25), ms(5))
                        .with_min_step(0.1),
                ),
            )
            .unwrap();
        registry
    }

    fn z_stack(slices: u32, step: f64) -> ZStack {
        ZStack {
            stage: "stage_z".into(),
            start: 0.0,
            step,
            slices,
        }
    }

    fn triggers(built: &BuiltExperiment) -> Vec<&ActionEntry> {
        built
            .table
            .entries()
            .iter()
            .filter(|e| e.kind == ActionKind::CameraTrigger)
            .collect()
    }

    fn moves(built: &BuiltExperiment) -> Vec<&ActionEntry> {
        built
            .table
            .entries()
            .iter()
            .filter(|e| e.kind == ActionKind::StageMove)
            .collect()
    }

    #[test]
    fn z_stack_moves_settle_before_each_trigger() {
        let registry = registry();
        let spec = ExperimentSpec::new("stack", 1)
            .with_z_stack(z_stack(3, 1.0))
            .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(50)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let moves = moves(&built);
        let triggers = triggers(&built);
        assert_eq!(moves.len(), 3);
        assert_eq!(triggers.len(), 3);
        for (mv, trig) in moves.iter().zip(&triggers) {
            assert!(trig.timestamp >= mv.timestamp + ms(30));
        }
        assert_eq!(built.table.camera_trigger_count(Some("cam_a")), 3);
    }

    #[test]
    fn trigger_count_is_product_of_dimensions() {
        let registry = registry();
        let spec = ExperimentSpec::new("grid", 2)
            .with_z_stack(z_stack(4, 0.5))
            .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(10)))
            .with_channel(ChannelSpec::new("561", "cam_a", Some("laser_561"), ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        assert_eq!(triggers(&built).len(), 2 * 4 * 2);

        let times: Vec<_> = triggers(&built).iter().map(|e| e.timestamp).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn acquisition_order_is_timepoint_z_channel() {
        let registry = registry();
        let spec = ExperimentSpec::new("order", 2)
            .with_z_stack(z_stack(2, 1.0))
            .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(10)))
            .with_channel(ChannelSpec::new("561", "cam_a", Some("laser_561"), ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let keys: Vec<_> = built
            .acquisition
            .iter()
            .map(|s| (s.key.timepoint, s.key.z_index, s.key.channel.clone()))
            .collect();
        let mut expected = Vec::new();
        for t in 0..2 {
            for z in 0..2 {
                for c in ["488", "561"] {
                    expected.push((t, z, c.to_string()));
                }
            }
        }
        assert_eq!(keys, expected);

        // trigger order reproduces slot order
        let trigger_times: Vec<_> = triggers(&built).iter().map(|e| e.timestamp).collect();
        let slot_times: Vec<_> = built.acquisition.iter().map(|s| s.expected_at).collect();
        assert_eq!(trigger_times, slot_times);
        let indices: Vec<_> = built.acquisition.iter().map(|s| s.camera_frame_index).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn no_target_has_two_entries_at_one_time() {
        let registry = registry();
        let spec = ExperimentSpec::new("dual", 3)
            .with_z_stack(z_stack(2, 1.0))
            .with_channel(ChannelSpec {
                cameras: vec!["cam_a".into(), "cam_b".into()],
                ..ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(10))
            });

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let mut seen = HashSet::new();
        for entry in built.table.entries() {
            assert!(seen.insert((entry.target.clone(), entry.timestamp)));
        }
    }

    #[test]
    fn single_plane_has_no_stage_moves() {
        let registry = registry();
        let spec = ExperimentSpec::new("flat", 2)
            .with_z_stack(z_stack(0, 1.0))
            .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        assert!(moves(&built).is_empty());
        assert!(built.stage.is_none());
        assert!(built.acquisition.iter().all(|s| s.stage_position.is_none()));
    }

    #[test]
    fn channels_sharing_a_camera_wait_for_readout() {
        let registry = registry();
        let spec = ExperimentSpec::new("readout", 1)
            .with_channel(ChannelSpec::new("488", "cam_b", Some("laser_488"), ms(10)))
            .with_channel(ChannelSpec::new("561", "cam_b", Some("laser_561"), ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let times: Vec<_> = triggers(&built).iter().map(|e| e.timestamp).collect();
        assert!(times[1] >= times[0] + ms(10) + ms(20));
    }

    #[test]
    fn short_exposure_rejected_unless_stretched() {
        let registry = registry();
        let spec = ExperimentSpec::new("short", 1)
            .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(4)));
        let err = ActionTableBuilder::new(&registry).build(&spec).unwrap_err();
        assert!(matches!(err, DaqError::InvalidSpec(_)));

        let mut stretched = spec.clone();
        stretched.channels[0].stretch_to_camera_minimum = true;
        let built = ActionTableBuilder::new(&registry).build(&stretched).unwrap();

        let camera = triggers(&built)[0].clone();
        let light = built
            .table
            .entries()
            .iter()
            .find(|e| e.kind == ActionKind::LightTrigger)
            .unwrap();
        assert_eq!(camera.payload, Payload::Pulse(ms(10)));
        assert_eq!(light.payload, Payload::Pulse(ms(4)));
        assert_eq!(light.timestamp, camera.timestamp + ms(3));
    }

    #[test]
    fn z_step_below_stage_resolution_is_rejected() {
        let registry = registry();
        let spec = ExperimentSpec::new("fine", 1)
            .with_z_stack(z_stack(3, 0.05))
            .with_channel(ChannelSpec::new("488", "cam_a", None, ms(10)));
        assert!(matches!(
            ActionTableBuilder::new(&registry).build(&spec),
            Err(DaqError::InvalidSpec(_))
        ));
    }

    #[test]
    fn unknown_devices_and_empty_specs_are_rejected() {
        let registry = registry();
        let builder = ActionTableBuilder::new(&registry);

        let no_channels = ExperimentSpec::new("empty", 1);
        assert!(builder.build(&no_channels).is_err());

        let unknown = ExperimentSpec::new("unknown", 1)
            .with_channel(ChannelSpec::new("488", "cam_x", None, ms(10)));
        assert!(builder.build(&unknown).is_err());

        let wrong_role = ExperimentSpec::new("role", 1)
            .with_channel(ChannelSpec::new("488", "cam_a", Some("stage_z"), ms(10)));
        assert!(builder.build(&wrong_role).is_err());

        let duplicate = ExperimentSpec::new("dup", 1)
            .with_channel(ChannelSpec::new("488", "cam_a", None, ms(10)))
            .with_channel(ChannelSpec::new("488", "cam_b", None, ms(10)));
        assert!(builder.build(&duplicate).is_err());
    }

    #[test]
    fn interval_pins_timepoint_starts() {
        let registry = registry();
        let spec = ExperimentSpec::new("lapse", 3)
            .with_timepoint_interval(ms(200))
            .with_channel(ChannelSpec::new("488", "cam_a", None, ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let times: Vec<_> = triggers(&built).iter().map(|e| e.timestamp).collect();
        assert_eq!(times, vec![ms(0), ms(200), ms(400)]);
        assert_eq!(built.table.total_duration(), ms(600));

        let too_short = ExperimentSpec::new("lapse", 3)
            .with_timepoint_interval(ms(5))
            .with_channel(ChannelSpec::new("488", "cam_a", None, ms(10)));
        assert!(ActionTableBuilder::new(&registry).build(&too_short).is_err());
    }

    #[test]
    fn shutters_bracket_the_pass() {
        let registry = registry();
        let spec = ExperimentSpec::new("shutter", 1)
            .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let shutter = TargetHandle::Digital(DigitalLine(2));
        let first = &built.table.entries()[0];
        assert_eq!(first.target, shutter);
        assert_eq!(first.payload, Payload::Digital(true));

        let close = built.table.last_action_for(&shutter).unwrap();
        assert_eq!(close.payload, Payload::Digital(false));
        assert_eq!(close.timestamp, ms(10) + SHUTTER_CLOSE_DELAY);
    }

    #[test]
    fn repeats_shift_slots() {
        let registry = registry();
        let spec = ExperimentSpec::new("repeat", 2)
            .with_repeat_count(3)
            .with_channel(ChannelSpec::new("488", "cam_a", None, ms(10)));

        let built = ActionTableBuilder::new(&registry).build(&spec).unwrap();
        let all = built.all_slots();
        assert_eq!(all.len(), 6);
        assert_eq!(all[2].key.timepoint, 2);
        assert_eq!(all[2].camera_frame_index, 2);
        assert_eq!(all[2].expected_at, built.table.total_duration());
        assert_eq!(all[5].key.timepoint, 5);
    }

    #[test]
    fn first_move_covers_return_from_last_plane() {
        let registry = registry();
        let stage = registry.get_stage("stage_z").unwrap();
        let spec = ExperimentSpec::new("cycle", 1)
            .with_repeat_count(2)
            .with_z_stack(z_stack(2, 1.0))
            .with_channel(ChannelSpec::new("488", "cam_a", None, ms(10)));

        let built = ActionTableBuilder::new(&registry)
            .with_stage_origin(0.0)
            .build(&spec)
            .unwrap();
        let first_trigger = triggers(&built)[0].timestamp;
        assert!(first_trigger >= stage.movement_time(1.0, 0.0).total());
        assert_eq!(built.participants, vec!["stage_z", "cam_a"]);
    }
}

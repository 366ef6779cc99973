//! Integration tests for the experiment engine against simulated hardware
//!
//! Every test wires a fresh registry: one mock executor, one camera, one gated laser and one
//! Z stage, all listening to the executor's output lines.

use rust_scope::config::ScopeConfig;
use rust_scope::data::frame::{PlaneStatus, SlotKey};
use rust_scope::data::writer::StackMetadata;
use rust_scope::error::DaqError;
use rust_scope::events::{DeviceFault, EventBus};
use rust_scope::experiment::{
    ChannelSpec, ExperimentEngine, ExperimentSpec, ExperimentState, RunRecord, RunStatus, ZStack,
};
use rust_scope::hardware::capabilities::{Armable, DigitalLine, StageAxis};
use rust_scope::hardware::mock::{MockCamera, MockExecutor, MockLight, MockStage};
use rust_scope::hardware::DeviceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

// =============================================================================
// Fixture
// =============================================================================

struct Rig {
    engine: ExperimentEngine,
    camera: Arc<MockCamera>,
    light: Arc<MockLight>,
    stage: Arc<MockStage>,
    events: EventBus,
    output: TempDir,
}

struct RigOptions {
    fail_after: Option<Duration>,
    dropped: Vec<u64>,
    light_arm_failure: bool,
    hung_camera_disarm: bool,
    camera_line: u8,
    light_arm_delay: Option<Duration>,
    stage_position_failure: bool,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            fail_after: None,
            dropped: Vec::new(),
            light_arm_failure: false,
            hung_camera_disarm: false,
            camera_line: 0,
            light_arm_delay: None,
            stage_position_failure: false,
        }
    }
}

fn rig(options: RigOptions) -> Rig {
    let output = tempfile::tempdir().unwrap();
    let mut config = ScopeConfig::default();
    config.storage.output_dir = output.path().to_path_buf();
    config.intake.frame_timeout = ms(100);
    config.engine.poll_interval = ms(5);
    config.engine.abort_grace = ms(200);

    let mut executor = MockExecutor::new(&config.executor);
    if let Some(after) = options.fail_after {
        executor = executor.with_fail_after(after);
    }
    let executor = Arc::new(executor);
    let bus = executor.line_bus();

    let events = EventBus::default();
    let mut registry = DeviceRegistry::new(events.clone());
    registry.set_mock_executor(executor);

    let mut camera = MockCamera::new("cam_a", DigitalLine(options.camera_line), bus.clone())
        .with_dropped_frames(options.dropped.clone());
    if options.hung_camera_disarm {
        camera = camera.with_hung_disarm();
    }
    let camera = Arc::new(camera);

    let mut light =
        MockLight::new("laser_488", DigitalLine(1), 488.0, bus.clone()).with_shutter(DigitalLine(2));
    if options.light_arm_failure {
        light = light.with_arm_failure();
    }
    if let Some(delay) = options.light_arm_delay {
        light = light.with_arm_delay(delay);
    }
    let light = Arc::new(light);

    let mut stage = MockStage::new("stage_z", 0, bus)
        .with_movement_time(ms(25), ms(5))
        .with_events(events.clone());
    if options.stage_position_failure {
        stage = stage.with_position_failure();
    }
    let stage = Arc::new(stage);

    registry.register_camera("cam_a", camera.clone()).unwrap();
    registry.register_light("laser_488", light.clone()).unwrap();
    registry.register_stage("stage_z", stage.clone()).unwrap();

    Rig {
        engine: ExperimentEngine::new(Arc::new(registry), config),
        camera,
        light,
        stage,
        events,
        output,
    }
}

fn z_stack_spec(timepoints: u32, slices: u32) -> ExperimentSpec {
    ExperimentSpec::new("stack", timepoints)
        .with_z_stack(ZStack {
            stage: "stage_z".into(),
            start: 0.0,
            step: 1.0,
            slices,
        })
        .with_channel(ChannelSpec::new("488", "cam_a", Some("laser_488"), ms(20)))
}

// =============================================================================
// Completed runs
// =============================================================================

#[tokio::test]
async fn test_z_stack_run_completes() {
    let rig = rig(RigOptions::default());
    let handle = rig.engine.start(z_stack_spec(1, 3)).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.missing_frame_count, 0);
    assert_eq!(result.planes.len(), 3);
    assert!(result.planes.iter().all(|p| p.status == PlaneStatus::Written));
    assert_eq!(result.completed_index, result.total_entries);
    assert!(result.lights_idle);
    assert!(result.unrecoverable_devices.is_empty());
    assert!(result.error.is_none());

    // planes come back in acquisition order
    let z: Vec<u32> = result.planes.iter().map(|p| p.slot.z_index).collect();
    assert_eq!(z, vec![0, 1, 2]);

    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert_eq!(rig.camera.frames_exposed(), 3);
    assert_eq!(rig.light.pulse_count(), 3);
    assert!(!rig.camera.is_armed().await.unwrap());
    assert!((rig.stage.position().await.unwrap() - 0.0).abs() < 1e-9);

    let metadata_path = result.metadata_path.unwrap();
    let stored = StackMetadata::load(&metadata_path).unwrap();
    assert_eq!(stored.planes.len(), 3);
    assert!(result.output_path.unwrap().exists());
}

#[tokio::test]
async fn test_missing_frame_is_reported_not_fatal() {
    let rig = rig(RigOptions {
        dropped: vec![1],
        ..Default::default()
    });
    let result = rig
        .engine
        .start(z_stack_spec(1, 3))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.missing_frame_count, 1);
    assert_eq!(
        result.missing_frames[0].slot,
        SlotKey::new(0, 1, "488", "cam_a")
    );
    let statuses: Vec<PlaneStatus> = result.planes.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![PlaneStatus::Written, PlaneStatus::Missing, PlaneStatus::Written]
    );
}

#[tokio::test]
async fn test_run_is_archived() {
    let rig = rig(RigOptions::default());
    let handle = rig.engine.start(z_stack_spec(1, 2)).await.unwrap();
    let run_id = handle.run_id().to_string();
    handle.wait().await.unwrap();

    let record = RunRecord::load(RunRecord::default_path(rig.output.path(), &run_id)).unwrap();
    assert_eq!(record.result.status, RunStatus::Completed);
    let states: Vec<ExperimentState> = record.history.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            ExperimentState::Preparing,
            ExperimentState::Running,
            ExperimentState::Completing,
        ]
    );
}

// =============================================================================
// Early termination
// =============================================================================

#[tokio::test]
async fn test_connection_loss_aborts_and_idles_lights() {
    let rig = rig(RigOptions {
        fail_after: Some(ms(80)),
        ..Default::default()
    });
    let mut transitions = rig.events.subscribe_state();

    let spec = z_stack_spec(4, 3);
    let result = rig.engine.start(spec).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap_or("").contains("timing executor lost"));
    assert!(result.lights_idle);
    assert!(result.completed_index < result.total_entries);
    assert!(result
        .planes
        .iter()
        .any(|p| p.status == PlaneStatus::NotAcquired));
    assert_eq!(rig.engine.state(), ExperimentState::Idle);

    let mut seen = Vec::new();
    while let Ok(change) = transitions.try_recv() {
        seen.push(change.to);
    }
    assert_eq!(
        seen,
        vec![
            ExperimentState::Preparing,
            ExperimentState::Running,
            ExperimentState::Aborting,
            ExperimentState::Idle,
        ]
    );
}

#[tokio::test]
async fn test_user_abort() {
    let rig = rig(RigOptions::default());
    let handle = rig.engine.start(z_stack_spec(20, 3)).await.unwrap();

    tokio::time::sleep(ms(50)).await;
    assert!(rig.engine.abort());
    // a second request before cleanup finishes is harmless
    rig.engine.abort();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Aborted);
    assert!(result.lights_idle);
    assert!(result.planes.len() == 60);
    assert!(result
        .planes
        .iter()
        .any(|p| p.status == PlaneStatus::NotAcquired));

    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert!(!rig.engine.abort());
}

#[tokio::test]
async fn test_abort_when_idle_is_noop() {
    let rig = rig(RigOptions::default());
    assert!(!rig.engine.abort());
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
}

#[tokio::test]
async fn test_second_start_is_busy() {
    let rig = rig(RigOptions::default());
    let handle = rig.engine.start(z_stack_spec(1, 3)).await.unwrap();

    let err = rig.engine.start(z_stack_spec(1, 3)).await.unwrap_err();
    assert!(matches!(err, DaqError::Busy { .. }));

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_on_idle_keeps_new_run_abortable() {
    let rig = rig(RigOptions::default());
    let mut states = rig.engine.subscribe_state();

    for _ in 0..10 {
        let first = rig.engine.start(z_stack_spec(1, 1)).await.unwrap();
        states
            .wait_for(|s| *s == ExperimentState::Idle)
            .await
            .unwrap();

        let second = rig.engine.start(z_stack_spec(5, 3)).await.unwrap();
        assert_eq!(
            rig.engine.status().run_id.as_deref(),
            Some(second.run_id())
        );
        assert!(rig.engine.abort());

        assert_eq!(first.wait().await.unwrap().status, RunStatus::Completed);
        let result = second.wait().await.unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(rig.engine.state(), ExperimentState::Idle);
        assert!(rig.engine.status().run_id.is_none());
    }
}

#[tokio::test]
async fn test_abort_while_preparing() {
    let rig = rig(RigOptions {
        light_arm_delay: Some(ms(100)),
        ..Default::default()
    });
    let mut states = rig.engine.subscribe_state();

    let engine = rig.engine.clone();
    let starting = tokio::spawn(async move { engine.start(z_stack_spec(5, 3)).await });
    states
        .wait_for(|s| *s == ExperimentState::Preparing)
        .await
        .unwrap();
    assert!(rig.engine.abort());

    let result = starting.await.unwrap().unwrap().wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Aborted);
    assert!(result.lights_idle);
    assert!(result.completed_index < result.total_entries);
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert!(!rig.light.is_armed().await.unwrap());
}

#[tokio::test]
async fn test_participant_fault_fails_the_run() {
    let rig = rig(RigOptions::default());
    let handle = rig.engine.start(z_stack_spec(20, 3)).await.unwrap();

    // published before the coordination task has polled once
    rig.events.device_fault(DeviceFault {
        device: "cam_a".into(),
        message: "sensor overheated".into(),
        unrecoverable: false,
    });

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap_or("").contains("sensor overheated"));
    assert!(result.lights_idle);
    assert!(!rig.camera.is_armed().await.unwrap());
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert_eq!(
        rig.engine.status().last_error.as_deref(),
        result.error.as_deref()
    );
}

#[tokio::test]
async fn test_fault_from_other_device_is_ignored() {
    let rig = rig(RigOptions::default());
    let handle = rig.engine.start(z_stack_spec(1, 2)).await.unwrap();
    rig.events.device_fault(DeviceFault {
        device: "laser_561".into(),
        message: "interlock open".into(),
        unrecoverable: false,
    });

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
}

// =============================================================================
// Preparation and cleanup failures
// =============================================================================

#[tokio::test]
async fn test_arm_refusal_returns_to_idle() {
    let rig = rig(RigOptions {
        light_arm_failure: true,
        ..Default::default()
    });

    let err = rig.engine.start(z_stack_spec(1, 3)).await.unwrap_err();
    match err {
        DaqError::Preparation { device, .. } => assert_eq!(device, "laser_488"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert!(rig.engine.status().last_error.is_some());
    // devices armed before the refusal were released
    assert!(!rig.camera.is_armed().await.unwrap());
    assert!(!rig.stage.is_armed().await.unwrap());
}

#[tokio::test]
async fn test_invalid_spec_touches_no_device() {
    let rig = rig(RigOptions::default());
    let spec = ExperimentSpec::new("bad", 1).with_channel(ChannelSpec::new(
        "488",
        "cam_missing",
        Some("laser_488"),
        ms(20),
    ));

    let err = rig.engine.start(spec).await.unwrap_err();
    assert!(matches!(err, DaqError::InvalidSpec(_)));
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert!(!rig.light.is_armed().await.unwrap());
}

#[tokio::test]
async fn test_hung_disarm_is_force_disconnected() {
    let rig = rig(RigOptions {
        hung_camera_disarm: true,
        ..Default::default()
    });
    let mut faults = rig.events.subscribe_faults();

    let result = rig
        .engine
        .start(z_stack_spec(1, 2))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(result.unrecoverable_devices, vec!["cam_a".to_string()]);
    assert!(rig.camera.was_force_disconnected());
    assert_eq!(rig.engine.state(), ExperimentState::Idle);

    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.device, "cam_a");
    assert!(fault.unrecoverable);
}

#[tokio::test]
async fn test_plan_does_not_touch_hardware() {
    let rig = rig(RigOptions::default());
    let built = rig.engine.plan(&z_stack_spec(2, 3)).unwrap();

    assert_eq!(built.table.camera_trigger_count(Some("cam_a")), 6);
    assert_eq!(built.acquisition.len(), 6);
    assert!(!rig.camera.is_armed().await.unwrap());
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
}

#[tokio::test]
async fn test_unreachable_stage_does_not_mask_invalid_spec() {
    let rig = rig(RigOptions {
        stage_position_failure: true,
        ..Default::default()
    });
    let spec = ExperimentSpec::new("bad", 1)
        .with_z_stack(ZStack {
            stage: "stage_z".into(),
            start: 0.0,
            step: 1.0,
            slices: 3,
        })
        .with_channel(ChannelSpec::new("488", "cam_missing", Some("laser_488"), ms(20)));

    let err = rig.engine.start(spec).await.unwrap_err();
    assert!(matches!(err, DaqError::InvalidSpec(_)));

    // a valid spec still needs the stage position
    let err = rig.engine.start(z_stack_spec(1, 3)).await.unwrap_err();
    match err {
        DaqError::Preparation { device, .. } => assert_eq!(device, "stage_z"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!rig.camera.is_armed().await.unwrap());
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
}

#[tokio::test]
async fn test_unwired_line_fails_before_arming() {
    let rig = rig(RigOptions {
        camera_line: 40,
        ..Default::default()
    });

    let err = rig.engine.start(z_stack_spec(1, 3)).await.unwrap_err();
    assert!(matches!(err, DaqError::Compile(_)));
    assert!(!rig.camera.is_armed().await.unwrap());
    assert!(!rig.light.is_armed().await.unwrap());
    assert!(!rig.stage.is_armed().await.unwrap());
    assert_eq!(rig.engine.state(), ExperimentState::Idle);
    assert!(rig.engine.status().run_id.is_none());
    assert!(!rig.engine.abort());
}

#[tokio::test]
async fn test_dropped_start_releases_devices() {
    let rig = rig(RigOptions {
        light_arm_delay: Some(ms(200)),
        ..Default::default()
    });
    let mut states = rig.engine.subscribe_state();

    let cut_short = tokio::time::timeout(ms(50), rig.engine.start(z_stack_spec(1, 2))).await;
    assert!(cut_short.is_err());

    tokio::time::timeout(ms(1000), states.wait_for(|s| *s == ExperimentState::Idle))
        .await
        .unwrap()
        .unwrap();
    assert!(!rig.camera.is_armed().await.unwrap());
    assert!(!rig.stage.is_armed().await.unwrap());
    assert_eq!(
        rig.engine.status().last_error.as_deref(),
        Some("preparation interrupted")
    );

    // the engine is usable again
    let result = rig
        .engine
        .start(z_stack_spec(1, 2))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
}

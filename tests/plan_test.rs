//! Integration tests for planning from the shipped configuration files
//!
//! Builds the sample Z stack against the devices declared in `config/scope.toml` and checks the
//! table timing end to end: builder, compiler and registry wiring.

use rust_scope::config::ScopeConfig;
use rust_scope::events::EventBus;
use rust_scope::experiment::{
    ActionKind, ExperimentEngine, ExperimentSpec, LineMap, Payload, TargetHandle, TimingCompiler,
};
use rust_scope::hardware::DeviceRegistry;
use std::sync::Arc;
use std::time::Duration;

async fn engine() -> ExperimentEngine {
    let config = ScopeConfig::load_from("config/scope.toml").unwrap();
    config.validate().unwrap();
    let registry = DeviceRegistry::from_config(&config, &EventBus::default())
        .await
        .unwrap();
    ExperimentEngine::new(Arc::new(registry), config)
}

#[tokio::test]
async fn test_sample_spec_settles_stage_before_every_trigger() {
    let engine = engine().await;
    let spec = ExperimentSpec::load("config/zstack_488.toml").unwrap();
    let built = engine.plan(&spec).unwrap();
    let entries = built.table.entries();

    let moves: Vec<Duration> = entries
        .iter()
        .filter(|e| e.kind == ActionKind::StageMove)
        .map(|e| e.timestamp)
        .collect();
    let triggers: Vec<Duration> = entries
        .iter()
        .filter(|e| e.kind == ActionKind::CameraTrigger)
        .map(|e| e.timestamp)
        .collect();

    // 2 timepoints x 3 planes x 1 channel
    assert_eq!(triggers.len(), 6);
    for trigger in &triggers {
        if let Some(last_move) = moves.iter().filter(|m| *m <= trigger).max() {
            assert!(*trigger >= *last_move + Duration::from_millis(30));
        }
    }

    // second timepoint starts on the interval
    assert!(triggers[3] >= Duration::from_secs(2));

    // camera window matches the requested exposure
    let cam = TargetHandle::Device("cam_a".into());
    let first = entries.iter().find(|e| e.target == cam).unwrap();
    assert_eq!(first.payload, Payload::Pulse(Duration::from_millis(50)));
}

#[tokio::test]
async fn test_sample_spec_compiles_to_executor_ticks() {
    let engine = engine().await;
    let spec = ExperimentSpec::load("config/zstack_488.toml").unwrap();
    let built = engine.plan(&spec).unwrap();

    let config = ScopeConfig::load_from("config/scope.toml").unwrap();
    let compiler = TimingCompiler::new(
        &config.executor,
        LineMap::from_registry(engine.registry()),
    );
    let profile = compiler.compile(&built.table).unwrap();

    assert_eq!(profile.ticks_per_second, 100_000);
    assert_eq!(profile.repeat_count, 1);
    let drift = profile
        .cycle_duration()
        .abs_diff(built.table.total_duration());
    assert!(drift <= Duration::from_micros(10));
    assert!(!profile.digital.is_empty());
    assert_eq!(profile.analog.len(), 1);
}

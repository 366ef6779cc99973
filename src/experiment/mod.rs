//! Experiment execution.
//!
//! - **spec**: what the user asks for (timepoints, Z stack, channels)
//! - **builder**: turns a spec into an [`action_table::ActionTable`] and an acquisition plan
//! - **compiler**: lowers a table to the executor's tick-based profile
//! - **executor**: upload/start/poll/abort against the timing executor
//! - **run_engine**: the state machine that runs one experiment at a time
//! - **state**: lifecycle states and run archiving

pub mod action_table;
pub mod builder;
pub mod compiler;
pub mod executor;
pub mod run_engine;
pub mod spec;
pub mod state;

pub use action_table::{ActionEntry, ActionKind, ActionTable, Payload, TargetHandle};
pub use builder::{ActionTableBuilder, BuiltExperiment};
pub use compiler::{CompiledProfile, LineMap, TimingCompiler};
pub use executor::{ExecutorClient, ExecutorPhase, ExecutorStatus, TableHandle};
pub use run_engine::{EngineStatus, ExperimentEngine, RunHandle, RunResult, RunStatus};
pub use spec::{ChannelSpec, ExperimentSpec, ZStack};
pub use state::{ExperimentState, RunRecord, StateTransition};

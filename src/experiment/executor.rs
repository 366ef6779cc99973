//! Executor client.
//!
//! Serializes every interaction with the timing executor for one coordination task: compile and
//! upload a table, start it, poll progress, abort. At most one table is held at a time, and the
//! uploaded table and its compiled profile sit behind `Arc`s so nothing can alter them once
//! `start` has been issued.
//!
//! Connection failures while a table is running surface as [`DaqError::ConnectionLost`]. They are
//! never retried: a partially executed table cannot be resumed because the state of the
//! downstream hardware is unknown.

use crate::error::{AppResult, DaqError};
use crate::experiment::action_table::ActionTable;
use crate::experiment::compiler::{CompiledProfile, TimingCompiler};
use crate::hardware::capabilities::TimingExecutor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one uploaded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableHandle(Uuid);

impl TableHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table-{}", self.0)
    }
}

/// Lifecycle of an uploaded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPhase {
    /// Uploaded, not started
    Pending,
    /// Playing
    Running,
    /// Every pass played
    Completed,
    /// Stopped before the end
    Aborted,
}

impl fmt::Display for ExecutorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorPhase::Pending => write!(f, "pending"),
            ExecutorPhase::Running => write!(f, "running"),
            ExecutorPhase::Completed => write!(f, "completed"),
            ExecutorPhase::Aborted => write!(f, "aborted"),
        }
    }
}

/// Progress of an uploaded table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    /// Current phase
    pub phase: ExecutorPhase,
    /// Table entries executed, counted over all passes
    pub completed_index: u64,
    /// Entries over all passes (`table.len() * repeat_count`)
    pub total: u64,
    /// Fault reported by the executor, if any
    pub error: Option<String>,
}

impl ExecutorStatus {
    /// Whether the table has been played to the end
    pub fn is_complete(&self) -> bool {
        self.phase == ExecutorPhase::Completed && self.completed_index == self.total
    }
}

struct ActiveTable {
    handle: TableHandle,
    table: Arc<ActionTable>,
    profile: Arc<CompiledProfile>,
    phase: ExecutorPhase,
    completed_index: u64,
    error: Option<String>,
}

impl ActiveTable {
    fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            phase: self.phase,
            completed_index: self.completed_index,
            total: self.table.total_entries(),
            error: self.error.clone(),
        }
    }
}

/// Client for one timing executor.
///
/// Methods take `&mut self`: the owner (the coordination task) is the only caller, which keeps
/// upload, start and abort from ever running concurrently.
pub struct ExecutorClient {
    executor: Arc<dyn TimingExecutor>,
    compiler: TimingCompiler,
    active: Option<ActiveTable>,
}

impl ExecutorClient {
    /// Client holding no table yet; `compiler` converts every upload for `executor`.
    pub fn new(executor: Arc<dyn TimingExecutor>, compiler: TimingCompiler) -> Self {
        Self {
            executor,
            compiler,
            active: None,
        }
    }

    /// Compiler used for uploads
    pub fn compiler(&self) -> &TimingCompiler {
        &self.compiler
    }

    /// Handle of the table currently held, if any
    pub fn active_handle(&self) -> Option<TableHandle> {
        self.active.as_ref().map(|a| a.handle)
    }

    /// Table behind `handle`
    pub fn table(&self, handle: TableHandle) -> Option<Arc<ActionTable>> {
        self.active
            .as_ref()
            .filter(|a| a.handle == handle)
            .map(|a| a.table.clone())
    }

    /// Compile `table` and load it into the executor.
    ///
    /// Replaces a previously held table unless that table is still running.
    pub async fn upload(&mut self, table: Arc<ActionTable>) -> AppResult<TableHandle> {
        let profile = self.compiler.compile(&table)?;
        self.upload_compiled(table, profile).await
    }

    /// Load a table already compiled by [`ExecutorClient::compiler`].
    pub async fn upload_compiled(
        &mut self,
        table: Arc<ActionTable>,
        profile: CompiledProfile,
    ) -> AppResult<TableHandle> {
        if let Some(active) = &self.active {
            if active.phase == ExecutorPhase::Running {
                return Err(DaqError::Executor(format!(
                    "cannot upload while {} is running",
                    active.handle
                )));
            }
        }

        let profile = Arc::new(profile);
        self.executor
            .upload(profile.clone())
            .await
            .map_err(|e| DaqError::Executor(format!("upload rejected: {:#}", e)))?;

        let handle = TableHandle::new();
        info!(
            %handle,
            entries = table.len(),
            rows = profile.digital.len(),
            passes = table.repeat_count(),
            "Action table uploaded"
        );
        self.active = Some(ActiveTable {
            handle,
            table,
            profile,
            phase: ExecutorPhase::Pending,
            completed_index: 0,
            error: None,
        });
        Ok(handle)
    }

    /// Begin playback. Returns as soon as the executor has accepted the start.
    pub async fn start(&mut self, handle: TableHandle) -> AppResult<()> {
        let active = self.held(handle)?;
        if active.phase != ExecutorPhase::Pending {
            return Err(DaqError::Executor(format!(
                "{} cannot start from phase {}",
                handle, active.phase
            )));
        }
        self.executor
            .start()
            .await
            .map_err(|e| DaqError::Executor(format!("start rejected: {:#}", e)))?;
        if let Some(active) = self.active.as_mut() {
            active.phase = ExecutorPhase::Running;
        }
        debug!(%handle, "Playback started");
        Ok(())
    }

    /// Stop playback and drive every output to the idle state.
    ///
    /// A no-op for a table that is not running. Idle outputs are read back from the executor;
    /// failing to reach it is reported as `ConnectionLost`.
    pub async fn abort(&mut self, handle: TableHandle) -> AppResult<()> {
        let phase = self.held(handle)?.phase;
        if phase != ExecutorPhase::Running {
            debug!(%handle, %phase, "Abort ignored: table not running");
            return Ok(());
        }
        if let Some(active) = self.active.as_mut() {
            active.phase = ExecutorPhase::Aborted;
            active.error.get_or_insert_with(|| "aborted".to_string());
        }
        warn!(%handle, "Aborting playback");
        self.halt_outputs().await
    }

    /// Halt outputs regardless of the table phase. Used by run cleanup.
    pub async fn force_idle(&mut self) -> AppResult<()> {
        if let Some(active) = self.active.as_mut() {
            if active.phase == ExecutorPhase::Running {
                active.phase = ExecutorPhase::Aborted;
            }
        }
        self.halt_outputs().await
    }

    /// Progress of `handle`.
    ///
    /// # Errors
    /// - `UnknownHandle` if `handle` is not the held table
    /// - `ConnectionLost` if the executor does not answer while the table runs
    pub async fn poll_status(&mut self, handle: TableHandle) -> AppResult<ExecutorStatus> {
        let active = self.held(handle)?;
        if active.phase != ExecutorPhase::Running {
            return Ok(active.status());
        }

        let hw = self
            .executor
            .status()
            .await
            .map_err(|e| DaqError::ConnectionLost(format!("{:#}", e)))?;

        let Some(active) = self.active.as_mut() else {
            return Err(DaqError::UnknownHandle(handle));
        };
        let repeat = active.table.repeat_count();
        active.completed_index = active.profile.completed_entries(hw.cycles_completed, hw.last_tick);
        if let Some(fault) = hw.fault {
            active.error = Some(fault);
        }
        if !hw.running {
            if hw.cycles_completed >= repeat {
                active.phase = ExecutorPhase::Completed;
                active.completed_index = active.table.total_entries();
                info!(%handle, "Playback completed");
            } else {
                active.phase = ExecutorPhase::Aborted;
                active.error.get_or_insert_with(|| {
                    format!(
                        "executor stopped after {} of {} passes",
                        hw.cycles_completed, repeat
                    )
                });
                warn!(%handle, passes = hw.cycles_completed, "Playback stopped early");
            }
        }
        Ok(active.status())
    }

    fn held(&self, handle: TableHandle) -> AppResult<&ActiveTable> {
        self.active
            .as_ref()
            .filter(|a| a.handle == handle)
            .ok_or(DaqError::UnknownHandle(handle))
    }

    async fn halt_outputs(&self) -> AppResult<()> {
        let lost = |e: anyhow::Error| DaqError::ConnectionLost(format!("{:#}", e));
        self.executor.abort().await.map_err(lost)?;
        self.executor.set_idle().await.map_err(lost)?;
        let outputs = self.executor.output_state().await.map_err(lost)?;
        if outputs.digital != 0 {
            return Err(DaqError::Executor(format!(
                "outputs not idle after abort (word {:#x})",
                outputs.digital
            )));
        }
        Ok(())
    }
}

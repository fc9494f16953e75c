//! Execution registry
//!
//! In-memory map from process key to the live execution for that key.
//! At most one execution per key: `register` refuses a second one, callers
//! stop the old run first (see [`crate::service`]).

use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::warn;

use crate::error::{Result, SimError};
use crate::types::{RunState, StepMode};

/// One spawned run of the engine
#[derive(Debug)]
pub struct Execution {
    pub process_key: String,
    pub execution_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub step_mode: StepMode,
    pub script_path: PathBuf,
    child: Mutex<Child>,
    finished: Mutex<bool>,
    finished_cond: Condvar,
}

impl Execution {
    pub fn new(
        process_key: impl Into<String>,
        execution_id: impl Into<String>,
        step_mode: StepMode,
        script_path: impl Into<PathBuf>,
        child: Child,
    ) -> Self {
        Self {
            process_key: process_key.into(),
            execution_id: execution_id.into(),
            pid: child.id(),
            started_at: Utc::now(),
            step_mode,
            script_path: script_path.into(),
            child: Mutex::new(child),
            finished: Mutex::new(false),
            finished_cond: Condvar::new(),
        }
    }

    /// Exit code if the child has exited, `None` while it runs
    pub fn poll_exit(&self) -> Result<Option<i32>> {
        Ok(self.child.lock().try_wait()?.map(exit_code))
    }

    /// Exclusive access to the child process
    ///
    /// Hold it only briefly: status queries take the same lock.
    pub(crate) fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock()
    }

    /// Mark the run's host-side cleanup as done
    pub(crate) fn mark_finished(&self) {
        *self.finished.lock() = true;
        self.finished_cond.notify_all();
    }

    /// Block until the run's cleanup is done; `false` on timeout
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let mut finished = self.finished.lock();
        if !*finished {
            self.finished_cond
                .wait_while_for(&mut finished, |done| !*done, timeout);
        }
        *finished
    }

    /// Status snapshot derived from the child's exit state
    pub fn status(&self) -> ExecutionStatus {
        let return_code = match self.poll_exit() {
            Ok(code) => code,
            Err(e) => {
                warn!(process_key = %self.process_key, error = %e, "Failed to poll child");
                None
            }
        };
        ExecutionStatus {
            process_id: self.process_key.clone(),
            execution_id: self.execution_id.clone(),
            status: RunState::from_exit(return_code),
            pid: self.pid,
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            step_mode: self.step_mode,
            robot_file: self.script_path.display().to_string(),
            return_code,
        }
    }
}

/// Exit status → integer code; signal deaths map to `-signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Externally visible status of an execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub process_id: String,
    pub execution_id: String,
    pub status: RunState,
    pub pid: u32,
    pub started_at: String,
    pub step_mode: StepMode,
    pub robot_file: String,
    pub return_code: Option<i32>,
}

/// Thread-safe registry of live executions (lock-free per key)
#[derive(Clone, Default)]
pub struct ExecutionRegistry {
    live: Arc<DashMap<String, Arc<Execution>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution; fails if the key already has one
    pub fn register(&self, execution: Arc<Execution>) -> Result<()> {
        match self.live.entry(execution.process_key.clone()) {
            Entry::Occupied(existing) => Err(SimError::Conflict {
                key: execution.process_key.clone(),
                execution_id: existing.get().execution_id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<Execution>> {
        self.live.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.live.contains_key(key)
    }

    /// Remove whatever is registered under `key` (no-op if absent)
    pub fn remove(&self, key: &str) -> Option<Arc<Execution>> {
        self.live.remove(key).map(|(_, e)| e)
    }

    /// Remove `key` only if it still holds `execution_id`
    ///
    /// A finished run must not deregister the run that replaced it.
    pub fn remove_if_current(&self, key: &str, execution_id: &str) -> bool {
        self.live
            .remove_if(key, |_, e| e.execution_id == execution_id)
            .is_some()
    }

    /// Status snapshot of every registered execution
    pub fn list(&self) -> Vec<ExecutionStatus> {
        let executions: Vec<Arc<Execution>> =
            self.live.iter().map(|e| Arc::clone(e.value())).collect();
        let mut statuses: Vec<ExecutionStatus> = executions.iter().map(|e| e.status()).collect();
        statuses.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl std::fmt::Debug for ExecutionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

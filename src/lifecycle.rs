//! Process lifecycle manager
//!
//! Spawns the automation engine for one execution, tracks it in the
//! [`ExecutionRegistry`], streams its output into the host log and cleans up
//! when it exits.
//!
//! ```text
//! start ──► install shim ──► provision ──► retarget script ──► spawn ──► register
//!                                                                        │
//! wait  ◄── stream stdout/stderr ◄── poll exit ◄─────────────────────────┘
//!   └──► drop credential scope ──► deregister (if still current)
//! ```
//!
//! Waiting blocks, so callers run [`RunningExecution::wait`] on a blocking
//! worker ([`LifecycleManager::launch`] does this for them).

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::config::SimConfig;
use crate::credentials::{CredentialProvisioner, CredentialScope};
use crate::error::{Result, SimError};
use crate::probe::{shim, ENV_BRIDGE, ENV_PROCESS_ID, ENV_SOCKET_PATH, ENV_STEP_MODE, ENV_WS_URL};
use crate::registry::{exit_code, Execution, ExecutionRegistry, ExecutionStatus};
use crate::script::{validate_process_key, ScriptMaterializer};
use crate::types::StepMode;

/// Longest single hold of the child lock while waiting for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to start one execution
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub script_path: PathBuf,
    pub process_key: String,
    pub step_mode: StepMode,
    pub execution_id: String,
    pub connection_keys: Vec<String>,
}

/// Outcome of a finished execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub process_id: String,
    pub execution_id: String,
    pub pid: u32,
    pub return_code: i32,
}

/// How a stop request ended the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Child was already gone
    AlreadyExited,
    /// Exited within the grace period after terminate
    Graceful,
    /// Needed a forceful kill
    Forced,
}

/// Handle returned by [`LifecycleManager::launch`]
#[derive(Debug)]
pub struct LaunchHandle {
    pub pid: u32,
    pub execution_id: String,
    pub completion: JoinHandle<ExitReport>,
}

/// Spawned engine process awaiting completion
pub struct RunningExecution {
    execution: Arc<Execution>,
    scope: Option<CredentialScope>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    registry: ExecutionRegistry,
}

/// Engine process manager
#[derive(Clone)]
pub struct LifecycleManager {
    registry: ExecutionRegistry,
    provisioner: Arc<dyn CredentialProvisioner>,
    materializer: ScriptMaterializer,
    program: String,
    listener: String,
    bridge: PathBuf,
    ws_url: String,
    socket_path: String,
    stop_grace: Duration,
}

impl LifecycleManager {
    pub fn new(
        config: &SimConfig,
        registry: ExecutionRegistry,
        provisioner: Arc<dyn CredentialProvisioner>,
    ) -> Self {
        Self {
            registry,
            provisioner,
            materializer: ScriptMaterializer::new(
                config.workspace_dir(),
                config.credentials.remote_devdata_prefix.clone(),
            ),
            program: config.engine.program.clone(),
            listener: config.engine.listener.clone(),
            bridge: config.bridge_program(),
            ws_url: config.reporting.ws_url.clone(),
            socket_path: config.reporting.socket_path.clone(),
            stop_grace: config.stop_grace(),
        }
    }

    /// Override the engine program (e.g. a stand-in script in tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Override the `robot-sim` binary the listener shim talks to
    pub fn with_bridge(mut self, bridge: impl Into<PathBuf>) -> Self {
        self.bridge = bridge.into();
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    pub fn materializer(&self) -> &ScriptMaterializer {
        &self.materializer
    }

    /// Provision, spawn and register an execution
    ///
    /// Credential failures are logged and the run proceeds without them.
    /// Spawn failures propagate and leave nothing registered.
    #[instrument(
        skip(self, request),
        fields(process_key = %request.process_key, execution_id = %request.execution_id)
    )]
    pub async fn start(&self, request: LaunchRequest) -> Result<RunningExecution> {
        validate_process_key(&request.process_key)?;

        // Checked before provisioning: the scope directory of a live run
        // shares this key's path
        if let Some(live) = self.registry.lookup(&request.process_key) {
            return Err(SimError::Conflict {
                key: request.process_key.clone(),
                execution_id: live.execution_id.clone(),
            });
        }

        shim::install(self.materializer.workspace())?;

        let scope = match self
            .provisioner
            .provision(&request.process_key, &request.connection_keys)
            .await
        {
            Ok(scope) => {
                self.materializer
                    .retarget_or_warn(&request.script_path, scope.path());
                Some(scope)
            }
            Err(e) => {
                warn!(error = %e, "Credential provisioning failed, running without credentials");
                None
            }
        };

        let mut child = self.command(&request).spawn().map_err(|e| SimError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        info!(pid = child.id(), program = %self.program, "Engine started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let execution = Arc::new(Execution::new(
            request.process_key.clone(),
            request.execution_id.clone(),
            request.step_mode,
            request.script_path.clone(),
            child,
        ));

        if let Err(e) = self.registry.register(Arc::clone(&execution)) {
            // Lost a race with another start for this key
            let mut child = execution.child();
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        Ok(RunningExecution {
            execution,
            scope,
            stdout,
            stderr,
            registry: self.registry.clone(),
        })
    }

    /// Start an execution and wait for it on a blocking worker
    ///
    /// Returns as soon as the child is running.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchHandle> {
        let running = self.start(request).await?;
        let pid = running.pid();
        let execution_id = running.execution_id().to_string();
        let completion = tokio::task::spawn_blocking(move || running.wait());
        Ok(LaunchHandle {
            pid,
            execution_id,
            completion,
        })
    }

    /// Start an execution and wait until it exits
    pub async fn spawn(&self, request: LaunchRequest) -> Result<ExitReport> {
        let handle = self.launch(request).await?;
        handle
            .completion
            .await
            .map_err(|e| SimError::Worker(e.to_string()))
    }

    /// Stop the execution registered for `key`
    ///
    /// Returns `Ok(false)` if nothing is registered. Returns once the run's
    /// worker has released its credential scope, so a new run for the same
    /// key can provision without racing the old cleanup. Blocks for up to
    /// twice the grace period; call from a blocking context.
    #[instrument(skip(self))]
    pub fn stop(&self, key: &str) -> Result<bool> {
        let Some(execution) = self.registry.lookup(key) else {
            debug!("No execution registered");
            return Ok(false);
        };

        let kind = terminate(&execution, self.stop_grace)?;
        if !execution.wait_finished(self.stop_grace) {
            warn!(pid = execution.pid, "Worker did not finish cleanup within grace");
        }
        self.registry.remove_if_current(key, &execution.execution_id);
        info!(pid = execution.pid, ?kind, "Execution stopped");
        Ok(true)
    }

    /// Status of the execution registered for `key`
    pub fn status(&self, key: &str) -> Option<ExecutionStatus> {
        self.registry.lookup(key).map(|e| e.status())
    }

    pub fn list(&self) -> Vec<ExecutionStatus> {
        self.registry.list()
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let workspace = self.materializer.workspace();
        let mut cmd = Command::new(&self.program);
        cmd.arg(&request.script_path)
            .arg("--listener")
            .arg(&self.listener)
            .current_dir(workspace)
            .env(ENV_WS_URL, &self.ws_url)
            .env(ENV_SOCKET_PATH, &self.socket_path)
            .env(ENV_STEP_MODE, request.step_mode.as_str())
            .env(ENV_PROCESS_ID, &request.process_key)
            .env(ENV_BRIDGE, &self.bridge)
            .env("PYTHONPATH", python_path(workspace))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Workspace first so the engine finds the listener module
fn python_path(workspace: &Path) -> String {
    let workspace = workspace.display().to_string();
    match std::env::var("PYTHONPATH") {
        Ok(existing) if !existing.is_empty() => format!("{}:{}", workspace, existing),
        _ => workspace,
    }
}

/// Graceful terminate, then forceful kill after `grace`
///
/// The child lock is held only for short slices so status queries on the
/// same execution keep answering during the grace period.
pub fn terminate(execution: &Execution, grace: Duration) -> Result<StopKind> {
    let signalled = {
        let mut child = execution.child();
        if child.try_wait()?.is_some() {
            return Ok(StopKind::AlreadyExited);
        }
        send_terminate(&mut child)
    };

    match signalled {
        Err(e) => warn!(pid = execution.pid, error = %e, "Terminate signal failed, killing"),
        Ok(()) => {
            if wait_exit(execution, grace)?.is_some() {
                return Ok(StopKind::Graceful);
            }
            let timeout = SimError::TerminateTimeout {
                key: execution.process_key.clone(),
                grace_secs: grace.as_secs(),
            };
            warn!(pid = execution.pid, "{}", timeout);
        }
    }

    let mut child = execution.child();
    if child.try_wait()?.is_some() {
        return Ok(StopKind::Graceful);
    }
    child.kill().map_err(|e| SimError::Kill {
        key: execution.process_key.clone(),
        pid: execution.pid,
        reason: e.to_string(),
    })?;
    child.wait()?;
    Ok(StopKind::Forced)
}

/// Wait up to `timeout` for the child to exit, in lock-sized slices
fn wait_exit(execution: &Execution, timeout: Duration) -> Result<Option<i32>> {
    let deadline = Instant::now() + timeout;
    loop {
        let slice = EXIT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
        if let Some(status) = execution.child().wait_timeout(slice)? {
            return Ok(Some(exit_code(status)));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

fn stream_lines<R: Read>(reader: R, process_key: &str, stream: &'static str) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) => info!(target: "engine", process_key, stream, "{}", line.trim_end()),
            Err(e) => {
                debug!(process_key, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

impl RunningExecution {
    pub fn pid(&self) -> u32 {
        self.execution.pid
    }

    pub fn execution_id(&self) -> &str {
        &self.execution.execution_id
    }

    pub fn credential_dir(&self) -> Option<&Path> {
        self.scope.as_ref().map(|s| s.path())
    }

    /// Stream output until the child exits, then clean up
    ///
    /// Cleanup runs on every exit path: normal exit, stop/kill, or the
    /// child aborting on a failed step.
    pub fn wait(mut self) -> ExitReport {
        let key = self.execution.process_key.clone();

        let stderr_reader = self.stderr.take().map(|stderr| {
            let key = key.clone();
            thread::spawn(move || stream_lines(stderr, &key, "stderr"))
        });
        if let Some(stdout) = self.stdout.take() {
            stream_lines(stdout, &key, "stdout");
        }

        let return_code = loop {
            match self.execution.poll_exit() {
                Ok(Some(code)) => break code,
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    error!(process_key = %key, error = %e, "Lost track of engine process");
                    break -1;
                }
            }
        };
        if let Some(handle) = stderr_reader {
            let _ = handle.join();
        }
        info!(process_key = %key, return_code, "Engine finished");

        if let Some(scope) = self.scope.take() {
            if let Err(e) = scope.release() {
                warn!(process_key = %key, error = %e, "Failed to remove credential scope");
            }
        }
        self.registry.remove_if_current(&key, &self.execution.execution_id);

        ExitReport {
            process_id: key,
            execution_id: self.execution.execution_id.clone(),
            pid: self.execution.pid,
            return_code,
        }
    }
}

impl Drop for RunningExecution {
    fn drop(&mut self) {
        // Abandoned before `wait`: the scope still goes
        drop(self.scope.take());
        self.execution.mark_finished();
    }
}

impl std::fmt::Debug for RunningExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningExecution")
            .field("process_key", &self.execution.process_key)
            .field("pid", &self.execution.pid)
            .finish()
    }
}

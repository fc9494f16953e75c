//! Step-synchronization protocol
//!
//! Turns engine callbacks into the numbered event stream and drives the
//! step gate. One [`StepProtocol`] exists per engine process; all of its
//! state (sequence counter, step frames, connection) lives in that value and
//! is threaded through every callback.
//!
//! ```text
//! Connecting ──► Streaming ◄──► AwaitingContinue      (step mode, after each step)
//!     │              │
//!     ▼              ├──► FatalAbort                  (step FAIL, terminal)
//!  Degraded ─────────┴──► Terminated                  (suite end, terminal)
//! ```

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::channel::{ChannelConfig, OfflineReporter, Reporter, ReportingChannel};
use super::event::{
    step_display_name, suite_display_name, Callback, EngineStatus, Event, EventKind, LogEntry, Status,
    StepEndData, StepRef, StepStartData, SuiteRef, TestEndData, TestRef,
};
use super::gate::StepGate;
use crate::config::SimConfig;
use crate::error::SimError;
use crate::types::StepMode;

/// Flush window before disconnect on suite end
pub const RUN_END_GRACE: Duration = Duration::from_millis(500);
/// Flush window before disconnect on fatal abort
pub const ABORT_GRACE: Duration = Duration::from_millis(300);

/// Exit status of a process killed by a failed step
pub const ABORT_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Connecting,
    Streaming,
    Degraded,
    AwaitingContinue,
    FatalAbort,
    Terminated,
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolState::FatalAbort | ProtocolState::Terminated)
    }
}

/// What the caller should do after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

/// Terminates the host process on a failed step
pub trait AbortHandler: Send {
    fn abort(&self, code: i32);
}

/// Exits immediately, skipping unwinding and destructors
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl AbortHandler for ProcessExit {
    fn abort(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Open step on the keyword-call stack
#[derive(Debug)]
struct StepFrame {
    started: Instant,
    logs: Vec<LogEntry>,
}

/// Per-process protocol state
#[derive(Debug)]
pub struct ProtocolContext {
    process_id: String,
    step_mode: StepMode,
    seq: u64,
    frames: Vec<StepFrame>,
    state: ProtocolState,
}

impl ProtocolContext {
    pub fn new(process_id: impl Into<String>, step_mode: StepMode) -> Self {
        Self {
            process_id: process_id.into(),
            step_mode,
            seq: 0,
            frames: Vec::new(),
            state: ProtocolState::Connecting,
        }
    }

    fn next_event(&mut self, kind: EventKind) -> Event {
        self.seq += 1;
        Event::new(self.seq, self.process_id.as_str(), kind)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

pub struct StepProtocol {
    ctx: ProtocolContext,
    reporter: Box<dyn Reporter>,
    gate: Arc<StepGate>,
    echo: Option<Box<dyn Write + Send>>,
    abort: Box<dyn AbortHandler>,
}

impl StepProtocol {
    pub fn new(
        process_id: impl Into<String>,
        step_mode: StepMode,
        reporter: Box<dyn Reporter>,
        gate: Arc<StepGate>,
    ) -> Self {
        let mut ctx = ProtocolContext::new(process_id, step_mode);
        ctx.state = if reporter.is_connected() {
            ProtocolState::Streaming
        } else {
            ProtocolState::Degraded
        };
        Self {
            ctx,
            reporter,
            gate,
            echo: None,
            abort: Box::new(ProcessExit),
        }
    }

    /// Connect to the observer described by `config`
    ///
    /// Falls back to local-only reporting when the endpoint is unusable.
    pub fn connect(config: &SimConfig, process_id: &str, step_mode: StepMode) -> Self {
        let gate = Arc::new(StepGate::new(step_mode));
        let channel_config = ChannelConfig::from_config(config, process_id);
        let reporter: Box<dyn Reporter> =
            match ReportingChannel::connect(channel_config, Arc::clone(&gate)) {
                Ok(channel) => Box::new(channel),
                Err(e) => {
                    warn!(error = %e, "Reporting channel unavailable");
                    Box::new(OfflineReporter)
                }
            };
        info!(process_id, %step_mode, connected = reporter.is_connected(), "Probe ready");
        Self::new(process_id, step_mode, reporter, gate)
    }

    /// Write every event as an `EVT <json>` line to `echo`
    pub fn with_echo(mut self, echo: Box<dyn Write + Send>) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn with_abort_handler(mut self, abort: Box<dyn AbortHandler>) -> Self {
        self.abort = abort;
        self
    }

    pub fn state(&self) -> ProtocolState {
        self.ctx.state
    }

    pub fn gate(&self) -> Arc<StepGate> {
        Arc::clone(&self.gate)
    }

    pub fn context(&self) -> &ProtocolContext {
        &self.ctx
    }

    /// Handle one engine callback
    ///
    /// May block on the step gate. After a terminal state every callback is
    /// ignored.
    pub fn handle(&mut self, callback: Callback) -> Flow {
        match self.ctx.state {
            ProtocolState::FatalAbort => return Flow::Abort,
            ProtocolState::Terminated => {
                debug!("Callback after suite end ignored");
                return Flow::Continue;
            }
            _ => {}
        }

        match callback {
            Callback::SuiteStart { name, source } => {
                self.emit(EventKind::RunStart {
                    suite: SuiteRef {
                        name: suite_display_name(&name, source.as_deref()),
                    },
                });
            }
            Callback::SuiteEnd {
                name,
                source,
                status,
            } => {
                self.emit(EventKind::RunEnd {
                    suite: SuiteRef {
                        name: suite_display_name(&name, source.as_deref()),
                    },
                    status: Status::from(&status),
                });
                self.reporter.disconnect(RUN_END_GRACE);
                self.ctx.state = ProtocolState::Terminated;
            }
            Callback::TestStart { name, tags } => {
                self.emit(EventKind::TestStart {
                    test: TestRef {
                        name,
                        tags: Some(tags),
                    },
                });
            }
            Callback::TestEnd {
                name,
                status,
                message,
            } => {
                let status = Status::from(&status);
                let message = if status == Status::Error {
                    message
                } else {
                    String::new()
                };
                self.emit(EventKind::TestEnd {
                    test: TestRef { name, tags: None },
                    status,
                    data: TestEndData { message },
                });
            }
            Callback::KeywordStart {
                name,
                kwname,
                libname,
                args,
            } => {
                self.ctx.frames.push(StepFrame {
                    started: Instant::now(),
                    logs: Vec::new(),
                });
                let step = StepRef::named(step_display_name(&name, kwname.as_deref()));
                self.emit(EventKind::StepStart {
                    step,
                    data: StepStartData { lib: libname, args },
                });
            }
            Callback::KeywordEnd {
                name,
                kwname,
                status,
                args,
            } => return self.end_step(&name, kwname.as_deref(), &status, args),
            Callback::LogMessage { level, message } => {
                let entry = LogEntry { level, message };
                if let Some(frame) = self.ctx.frames.last_mut() {
                    frame.logs.push(entry.clone());
                }
                self.emit(EventKind::StepLog { data: entry });
            }
        }
        Flow::Continue
    }

    /// Close the channel if the engine went away without a suite end
    pub fn finish(&mut self) {
        if self.ctx.state.is_terminal() {
            return;
        }
        self.flush_echo();
        self.reporter.disconnect(RUN_END_GRACE);
        self.ctx.state = ProtocolState::Terminated;
    }

    fn end_step(
        &mut self,
        name: &str,
        kwname: Option<&str>,
        engine_status: &EngineStatus,
        args: Vec<serde_json::Value>,
    ) -> Flow {
        let failed = engine_status.is_fail();
        let status = Status::from(engine_status);
        let frame = self.ctx.frames.pop();
        let duration_ms = frame
            .as_ref()
            .map(|f| u64::try_from(f.started.elapsed().as_millis()).unwrap_or(u64::MAX));
        let logs = frame.map(|f| f.logs).unwrap_or_default();
        let message = logs.first().map(|l| l.message.clone());
        let step_name = step_display_name(name, kwname).to_string();

        self.emit(EventKind::StepEnd {
            step: StepRef::named(&step_name),
            status,
            data: StepEndData {
                duration_ms,
                message: message.clone(),
                args,
                logs,
            },
        });

        if failed {
            let failure = SimError::StepFailure {
                step: step_name.clone(),
                message: message.unwrap_or_default(),
            };
            error!(error = %failure, "Aborting run");
            self.ctx.state = ProtocolState::FatalAbort;
            self.flush_echo();
            self.reporter.disconnect(ABORT_GRACE);
            self.abort.abort(ABORT_EXIT_CODE);
            return Flow::Abort;
        }

        if self.ctx.step_mode == StepMode::Step {
            let resume = self.ctx.state;
            self.ctx.state = ProtocolState::AwaitingContinue;
            info!(step = %step_name, "Waiting for continueStep");
            self.gate.wait();
            self.ctx.state = resume;
        }
        Flow::Continue
    }

    fn emit(&mut self, kind: EventKind) {
        let event = self.ctx.next_event(kind);
        debug!(seq = event.seq, kind = event.kind.type_name(), "Event");

        if let Some(echo) = self.echo.as_mut() {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = writeln!(echo, "EVT {}", line).and_then(|_| echo.flush()) {
                        warn!(error = %e, "Failed to echo event");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode event"),
            }
        }

        self.reporter.report(&event);
        if self.ctx.state == ProtocolState::Streaming && !self.reporter.is_connected() {
            self.ctx.state = ProtocolState::Degraded;
        } else if self.ctx.state == ProtocolState::Degraded && self.reporter.is_connected() {
            self.ctx.state = ProtocolState::Streaming;
        }
    }

    fn flush_echo(&mut self) {
        if let Some(echo) = self.echo.as_mut() {
            let _ = echo.flush();
        }
    }
}

impl std::fmt::Debug for StepProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepProtocol")
            .field("ctx", &self.ctx)
            .field("connected", &self.reporter.is_connected())
            .finish()
    }
}

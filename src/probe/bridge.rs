//! Stdio bridge for the engine-side listener shim
//!
//! One JSON [`Callback`] per input line; each is answered with a single
//! `ok` line once it has been fully processed, which for a step end in step
//! mode means after the gate opened. On a fatal abort no answer is written
//! and the process exits, which the shim sees as a closed pipe.

use std::io::{BufRead, Write};

use tracing::{debug, warn};

use super::event::Callback;
use super::listener::{Flow, StepProtocol};
use super::{ENV_PROCESS_ID, ENV_STEP_MODE};
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::types::StepMode;

pub const REPLY_OK: &str = "ok";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Input closed; carries the number of callbacks handled
    Finished(usize),
    Aborted,
}

/// Process identity for a bridge session, read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub process_id: String,
    pub step_mode: StepMode,
}

impl BridgeOptions {
    pub fn from_env() -> Result<Self> {
        let process_id = std::env::var(ENV_PROCESS_ID)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SimError::Config {
                reason: format!("{} is not set", ENV_PROCESS_ID),
            })?;
        let step_mode = match std::env::var(ENV_STEP_MODE) {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => StepMode::default(),
        };
        Ok(Self {
            process_id,
            step_mode,
        })
    }
}

/// Feed callbacks from `input` through `protocol`, answering on `reply`
pub fn serve<R: BufRead, W: Write>(
    protocol: &mut StepProtocol,
    input: R,
    mut reply: W,
) -> Result<BridgeOutcome> {
    let mut handled = 0;
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Callback>(line) {
            Ok(callback) => {
                if protocol.handle(callback) == Flow::Abort {
                    return Ok(BridgeOutcome::Aborted);
                }
                handled += 1;
            }
            Err(e) => {
                // Answer anyway so the engine thread is not left waiting
                let err = SimError::InvalidCallback {
                    reason: e.to_string(),
                };
                warn!(error = %err, "Skipping callback");
            }
        }
        writeln!(reply, "{}", REPLY_OK)?;
        reply.flush()?;
    }

    debug!(handled, "Callback input closed");
    protocol.finish();
    Ok(BridgeOutcome::Finished(handled))
}

/// Run a bridge session on stdin/stdout; returns the process exit code
pub fn run(config: &SimConfig) -> Result<i32> {
    let options = BridgeOptions::from_env()?;
    let protocol = StepProtocol::connect(config, &options.process_id, options.step_mode);
    let mut protocol = protocol.with_echo(Box::new(std::io::stderr()));

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match serve(&mut protocol, stdin.lock(), stdout.lock())? {
        BridgeOutcome::Finished(_) => Ok(0),
        BridgeOutcome::Aborted => Ok(super::listener::ABORT_EXIT_CODE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::channel::OfflineReporter;
    use crate::probe::gate::StepGate;
    use crate::probe::listener::{AbortHandler, ProtocolState};
    use serial_test::serial;
    use std::io::Cursor;
    use std::sync::Arc;

    struct NoExit;

    impl AbortHandler for NoExit {
        fn abort(&self, _code: i32) {}
    }

    fn protocol() -> StepProtocol {
        StepProtocol::new(
            "P1",
            StepMode::All,
            Box::new(OfflineReporter),
            Arc::new(StepGate::open()),
        )
        .with_abort_handler(Box::new(NoExit))
    }

    #[test]
    fn answers_each_callback_with_ok() {
        let input = concat!(
            r#"{"callback":"suite_start","name":"S"}"#, "\n",
            "\n",
            r#"{"callback":"keyword_start","name":"Log","args":["x"]}"#, "\n",
            r#"{"callback":"keyword_end","name":"Log","status":"PASS"}"#, "\n",
        );
        let mut p = protocol();
        let mut out = Vec::new();
        let outcome = serve(&mut p, Cursor::new(input), &mut out).unwrap();

        assert_eq!(outcome, BridgeOutcome::Finished(3));
        assert_eq!(String::from_utf8(out).unwrap(), "ok\nok\nok\n");
        assert_eq!(p.state(), ProtocolState::Terminated);
    }

    #[test]
    fn malformed_line_is_answered_and_skipped() {
        let input = "not json\n{\"callback\":\"log_message\",\"message\":\"m\"}\n";
        let mut p = protocol();
        let mut out = Vec::new();
        let outcome = serve(&mut p, Cursor::new(input), &mut out).unwrap();
        assert_eq!(outcome, BridgeOutcome::Finished(1));
        assert_eq!(String::from_utf8(out).unwrap(), "ok\nok\n");
    }

    #[test]
    fn failed_step_stops_without_reply() {
        let input = concat!(
            r#"{"callback":"keyword_start","name":"Click"}"#, "\n",
            r#"{"callback":"keyword_end","name":"Click","status":"FAIL"}"#, "\n",
            r#"{"callback":"keyword_start","name":"Never"}"#, "\n",
        );
        let mut p = protocol();
        let mut out = Vec::new();
        let outcome = serve(&mut p, Cursor::new(input), &mut out).unwrap();
        assert_eq!(outcome, BridgeOutcome::Aborted);
        assert_eq!(String::from_utf8(out).unwrap(), "ok\n");
    }

    #[test]
    #[serial]
    fn options_from_env() {
        std::env::set_var(ENV_PROCESS_ID, "P9");
        std::env::set_var(ENV_STEP_MODE, "step");
        let options = BridgeOptions::from_env().unwrap();
        assert_eq!(options.process_id, "P9");
        assert_eq!(options.step_mode, StepMode::Step);

        std::env::set_var(ENV_STEP_MODE, "bogus");
        assert!(matches!(
            BridgeOptions::from_env(),
            Err(SimError::InvalidStepMode { .. })
        ));

        std::env::remove_var(ENV_PROCESS_ID);
        std::env::remove_var(ENV_STEP_MODE);
        assert!(BridgeOptions::from_env().is_err());
    }
}

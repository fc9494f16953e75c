//! Small shared value types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// How the step gate behaves inside a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Run every step without pausing
    #[default]
    All,
    /// Pause after each step until a continuation signal arrives
    Step,
}

impl StepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepMode::All => "all",
            StepMode::Step => "step",
        }
    }

    /// Map a front-end run type (`run-all` | `step-by-step`)
    pub fn from_run_type(run_type: &str) -> Self {
        if run_type == "step-by-step" {
            StepMode::Step
        } else {
            StepMode::All
        }
    }
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepMode {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(StepMode::All),
            "step" => Ok(StepMode::Step),
            _ => Err(SimError::InvalidStepMode {
                value: s.to_string(),
            }),
        }
    }
}

/// Derived state of an execution's child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

impl RunState {
    /// Exit code → state (`None` = not exited yet)
    pub fn from_exit(code: Option<i32>) -> Self {
        match code {
            None => RunState::Running,
            Some(0) => RunState::Completed,
            Some(_) => RunState::Failed,
        }
    }
}

//! Error types with fix suggestions
//!
//! Error code ranges:
//! - SIM-000-009: Script / input errors
//! - SIM-010-019: Execution lifecycle errors
//! - SIM-020-029: Credential errors
//! - SIM-030-039: Reporting channel / protocol errors
//! - SIM-040-049: Infrastructure (IO, config)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum SimError {
    // ─────────────────────────────────────────────────────────────
    // Script / input errors (SIM-000 to SIM-009)
    // ─────────────────────────────────────────────────────────────
    #[error("SIM-001: Invalid process key '{key}'")]
    InvalidProcessKey { key: String },

    #[error("SIM-002: Invalid script document: {reason}")]
    InvalidScript { reason: String },

    #[error("SIM-003: Invalid step mode '{value}' (expected 'all' or 'step')")]
    InvalidStepMode { value: String },

    // ─────────────────────────────────────────────────────────────
    // Execution lifecycle errors (SIM-010 to SIM-019)
    // ─────────────────────────────────────────────────────────────
    #[error("SIM-010: Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("SIM-011: Process '{key}' already has a live execution ({execution_id})")]
    Conflict { key: String, execution_id: String },

    #[error("SIM-012: Process '{key}' did not exit within {grace_secs}s of terminate")]
    TerminateTimeout { key: String, grace_secs: u64 },

    #[error("SIM-013: Failed to kill process '{key}' (pid {pid}): {reason}")]
    Kill { key: String, pid: u32, reason: String },

    #[error("SIM-014: Worker task failed: {0}")]
    Worker(String),

    // ─────────────────────────────────────────────────────────────
    // Credential errors (SIM-020 to SIM-029)
    // ─────────────────────────────────────────────────────────────
    #[error("SIM-020: Credential fetch failed: {reason}")]
    CredentialFetch { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Reporting / protocol errors (SIM-030 to SIM-039)
    // ─────────────────────────────────────────────────────────────
    #[error("SIM-030: Reporting channel error: {reason}")]
    Connection { reason: String },

    #[error("SIM-031: Step '{step}' failed: {message}")]
    StepFailure { step: String, message: String },

    #[error("SIM-032: Invalid callback payload: {reason}")]
    InvalidCallback { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Infrastructure (SIM-040 to SIM-049)
    // ─────────────────────────────────────────────────────────────
    #[error("SIM-040: Configuration error: {reason}")]
    Config { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Errors the run recovers from (logged, execution continues)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SimError::CredentialFetch { .. }
                | SimError::Connection { .. }
                | SimError::TerminateTimeout { .. }
        )
    }
}

impl FixSuggestion for SimError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            SimError::InvalidProcessKey { .. } => {
                Some("Use letters, digits, '_', '-' or '.' in process keys")
            }
            SimError::InvalidScript { .. } => {
                Some("Check the script JSON: it needs a 'tests' array with 'body' lists")
            }
            SimError::InvalidStepMode { .. } => Some("Use step mode 'all' or 'step'"),
            SimError::Spawn { .. } => {
                Some("Check the engine program is installed and on PATH (ROBOT_SIM_ENGINE)")
            }
            SimError::Conflict { .. } => Some("Stop the running execution before starting another"),
            SimError::TerminateTimeout { .. } => None,
            SimError::Kill { .. } => Some("Check the process still exists and is owned by this user"),
            SimError::Worker(_) => None,
            SimError::CredentialFetch { .. } => {
                Some("Check PROBE_WS_URL and ROBOT_SIM_SERVICE_KEY")
            }
            SimError::Connection { .. } => Some("Check the reporting server is reachable"),
            SimError::StepFailure { .. } => None,
            SimError::InvalidCallback { .. } => {
                Some("Send one JSON callback per line with a 'callback' tag")
            }
            SimError::Config { .. } => Some("Check ~/.config/robot-sim/config.toml syntax"),
            SimError::Io(_) => Some("Check file path and permissions"),
            SimError::Json(_) => Some("Check JSON syntax"),
        }
    }
}

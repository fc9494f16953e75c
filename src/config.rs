//! Robot-sim Configuration Module
//!
//! Config is stored in `~/.config/robot-sim/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`PROBE_WS_URL`, `ROBOT_SIM_*`)
//! 2. Config file (`~/.config/robot-sim/config.toml`)
//! 3. Defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::probe::{ENV_BRIDGE, ENV_SOCKET_PATH, ENV_WS_URL};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// Working directory for script files and credential scopes
    /// (defaults to the current directory)
    pub workspace: Option<PathBuf>,

    pub engine: EngineConfig,

    pub reporting: ReportingConfig,

    pub credentials: CredentialConfig,
}

/// Engine subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Command spawned per execution (receives the script path)
    pub program: String,

    /// Interpreter used by `run-json` (run as `<robot_program> -m robot`)
    pub robot_program: String,

    /// Listener reference handed to the engine
    pub listener: String,

    /// `robot-sim` binary the engine-side listener shim runs as
    /// `<bridge> listen` (defaults to the running executable)
    pub bridge_program: Option<PathBuf>,

    /// Seconds between graceful terminate and forceful kill
    pub stop_grace_secs: u64,
}

/// Reporting channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportingConfig {
    /// Reporting endpoint base URL (http/https/ws/wss)
    pub ws_url: String,

    /// Path of the event socket on the reporting server
    pub socket_path: String,

    /// Bounded connection attempts (initial connect and each reconnect)
    pub reconnect_attempts: u32,

    /// Fixed delay between connection attempts
    pub reconnect_delay_ms: u64,
}

/// Credential provisioning settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialConfig {
    /// `Service-Key` header for the credential endpoint
    pub service_key: Option<String>,

    /// Per-request timeout
    pub timeout_secs: u64,

    /// Deployment path prefix rewritten to the local devdata directory
    pub remote_devdata_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "rpa-runner".to_string(),
            robot_program: "python3".to_string(),
            listener: "probe_listener.ProbeListener".to_string(),
            bridge_program: None,
            stop_grace_secs: 5,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            ws_url: "http://127.0.0.1:8080".to_string(),
            socket_path: "/robot-report-logs-realtime".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            service_key: None,
            timeout_secs: 30,
            remote_devdata_prefix: "/home/ec2-user/robot/devdata/".to_string(),
        }
    }
}

impl SimConfig {
    /// Get the config directory path
    ///
    /// Returns `~/.config/robot-sim/` on Unix, `%APPDATA%/robot-sim/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("robot-sim")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| SimError::Config {
            reason: format!("Failed to read config file: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| SimError::Config {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = non_empty_env("ROBOT_SIM_WORKSPACE") {
            self.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty_env(ENV_WS_URL) {
            self.reporting.ws_url = v;
        }
        if let Some(v) = non_empty_env(ENV_SOCKET_PATH) {
            self.reporting.socket_path = v;
        }
        if let Some(v) = non_empty_env("ROBOT_SIM_ENGINE") {
            self.engine.program = v;
        }
        if let Some(v) = non_empty_env("ROBOT_SIM_ROBOT") {
            self.engine.robot_program = v;
        }
        if let Some(v) = non_empty_env("ROBOT_SIM_LISTENER") {
            self.engine.listener = v;
        }
        if let Some(v) = non_empty_env(ENV_BRIDGE) {
            self.engine.bridge_program = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty_env("ROBOT_SIM_SERVICE_KEY") {
            self.credentials.service_key = Some(v);
        }
        self
    }

    /// Effective workspace directory
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Bridge binary for the listener shim
    pub fn bridge_program(&self) -> PathBuf {
        self.engine
            .bridge_program
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("robot-sim"))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.engine.stop_grace_secs)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credentials.timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reporting.reconnect_delay_ms)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

//! Script materializer
//!
//! Writes one script file per process key into the workspace and points
//! deployment-specific data paths at their local equivalents.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SimError};

/// Valid process key: usable as a file name component
static PROCESS_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid regex"));

/// Name of the local data directory under the workspace
pub const DEVDATA_DIR: &str = "devdata";

/// Validate a caller-supplied process key
pub fn validate_process_key(key: &str) -> Result<()> {
    if key == "." || key == ".." || !PROCESS_KEY_PATTERN.is_match(key) {
        return Err(SimError::InvalidProcessKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Forward-slash form of a path, with a trailing slash
fn dir_prefix(path: &Path) -> String {
    let mut s = path.to_string_lossy().replace('\\', "/");
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Writes scripts into the workspace
#[derive(Debug, Clone)]
pub struct ScriptMaterializer {
    workspace: PathBuf,
    remote_prefix: String,
}

impl ScriptMaterializer {
    pub fn new(workspace: impl Into<PathBuf>, remote_prefix: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            remote_prefix: remote_prefix.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Local data directory (`<workspace>/devdata`)
    pub fn devdata_dir(&self) -> PathBuf {
        self.workspace.join(DEVDATA_DIR)
    }

    /// Script file path for a process key
    pub fn script_path(&self, process_key: &str) -> PathBuf {
        self.workspace.join(format!("robot_{}.json", process_key))
    }

    /// Write a script for `process_key`, returning its path
    ///
    /// JSON scripts are re-serialized pretty-printed; anything else is
    /// written as text. Both get the remote data prefix rewritten.
    pub fn write(&self, process_key: &str, script: &str) -> Result<PathBuf> {
        validate_process_key(process_key)?;
        fs::create_dir_all(&self.workspace)?;

        let path = self.script_path(process_key);
        let local = dir_prefix(&self.devdata_dir());
        let patched = script.replace(&self.remote_prefix, &local);

        let content = match serde_json::from_str::<Value>(&patched) {
            Ok(value) => serde_json::to_string_pretty(&value)?,
            Err(e) => {
                debug!(process_key, error = %e, "Script is not JSON, writing as text");
                patched
            }
        };

        fs::write(&path, content)?;
        debug!(process_key, path = %path.display(), "Script written");
        Ok(path)
    }

    /// Point data paths in an already written script at a credential directory
    ///
    /// Rewrites both the remote prefix and the default local devdata prefix.
    /// The local prefix goes first: the credential directory lives under it.
    pub fn retarget_credentials(&self, script_path: &Path, credential_dir: &Path) -> Result<()> {
        let content = fs::read_to_string(script_path)?;
        let target = dir_prefix(credential_dir);
        let local = dir_prefix(&self.devdata_dir());

        let patched = content
            .replace(&local, &target)
            .replace(&self.remote_prefix, &target);

        if patched != content {
            fs::write(script_path, patched)?;
            debug!(path = %script_path.display(), target = %target, "Retargeted credential paths");
        }
        Ok(())
    }

    /// Best-effort variant of [`Self::retarget_credentials`]: failures are logged
    pub fn retarget_or_warn(&self, script_path: &Path, credential_dir: &Path) {
        if let Err(e) = self.retarget_credentials(script_path, credential_dir) {
            warn!(path = %script_path.display(), error = %e, "Failed to retarget credential paths");
        }
    }
}

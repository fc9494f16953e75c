//! Engine-side listener shim
//!
//! The engine loads listeners as Python modules. This one forwards every
//! callback to `robot-sim listen` over a pipe and ends the engine process
//! when the pipe closes without a reply (fatal abort).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// File name of the shim module in the workspace
pub const MODULE_FILE: &str = "probe_listener.py";

/// Source of the shim module
pub const MODULE_SOURCE: &str = include_str!("probe_listener.py");

/// Write the shim into `workspace` unless an identical copy is there
pub fn install(workspace: &Path) -> Result<PathBuf> {
    let path = workspace.join(MODULE_FILE);
    if fs::read_to_string(&path).is_ok_and(|current| current == MODULE_SOURCE) {
        return Ok(path);
    }
    fs::create_dir_all(workspace)?;
    fs::write(&path, MODULE_SOURCE)?;
    debug!(path = %path.display(), "Listener shim installed");
    Ok(path)
}

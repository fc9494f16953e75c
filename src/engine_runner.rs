//! `run-json`: run a JSON script through the automation engine
//!
//! Scripts with concurrent blocks are transformed into a temporary `.json`
//! file first; the temp file lives as long as the [`PreparedScript`].

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;
use tracing::{info, instrument};

use crate::error::{Result, SimError};
use crate::registry::exit_code;
use crate::script::{transform, ScriptDocument};

/// `--listener <ref>` or `--listener=<ref>` from engine arguments
pub fn listener_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--listener" {
            return iter.next().cloned();
        }
        if let Some(value) = arg.strip_prefix("--listener=") {
            return Some(value.to_string());
        }
    }
    None
}

/// Script ready to hand to the engine
#[derive(Debug)]
pub struct PreparedScript {
    source: PathBuf,
    listener: Option<String>,
    transformed: Option<NamedTempFile>,
}

impl PreparedScript {
    /// File the engine should run
    pub fn target(&self) -> &Path {
        match &self.transformed {
            Some(temp) => temp.path(),
            None => &self.source,
        }
    }

    pub fn is_transformed(&self) -> bool {
        self.transformed.is_some()
    }

    pub fn listener(&self) -> Option<&str> {
        self.listener.as_deref()
    }

    /// Directory the engine runs in
    pub fn working_dir(&self) -> &Path {
        self.source.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Load `file` and transform it if it has concurrent blocks
pub fn prepare(file: &Path, engine_args: &[String]) -> Result<PreparedScript> {
    let source = fs::canonicalize(file)?;
    let doc = ScriptDocument::from_json(&fs::read_to_string(&source)?)?;
    let listener = listener_from_args(engine_args);

    if !doc.has_parallel_blocks() {
        info!(file = %source.display(), "No concurrent blocks, running directly");
        return Ok(PreparedScript {
            source,
            listener,
            transformed: None,
        });
    }

    info!(
        blocks = doc.parallel_block_count(),
        listener = listener.as_deref().unwrap_or(""),
        "Transforming concurrent blocks"
    );
    let transformed = transform(&doc, listener.as_deref().unwrap_or(""))?;
    let temp = tempfile::Builder::new()
        .prefix("robot-sim-")
        .suffix(".json")
        .tempfile()?;
    fs::write(temp.path(), transformed.to_json_pretty()?)?;
    info!(temp = %temp.path().display(), "Transformed script written");

    Ok(PreparedScript {
        source,
        listener,
        transformed: Some(temp),
    })
}

/// `<robot_program> -m robot <engine_args...> <target>`
pub fn engine_command(robot_program: &str, prepared: &PreparedScript, engine_args: &[String]) -> Command {
    let cwd = prepared.working_dir();
    let mut cmd = Command::new(robot_program);
    cmd.arg("-m")
        .arg("robot")
        .args(engine_args)
        .arg(prepared.target())
        .current_dir(cwd)
        .env("PYTHONPATH", cwd);
    if let Some(listener) = prepared.listener() {
        cmd.env("ROBOT_LISTENER", listener);
    }
    cmd
}

/// Run the engine on `file`, returning its exit code
#[instrument(skip(engine_args))]
pub fn run_json(robot_program: &str, file: &Path, engine_args: &[String]) -> Result<i32> {
    let prepared = prepare(file, engine_args)?;
    info!(
        target = %prepared.target().display(),
        cwd = %prepared.working_dir().display(),
        "Running engine"
    );

    let status = engine_command(robot_program, &prepared, engine_args)
        .status()
        .map_err(|e| SimError::Spawn {
            program: robot_program.to_string(),
            reason: e.to_string(),
        })?;
    let code = exit_code(status);
    info!(code, transformed = prepared.is_transformed(), "Engine exited");
    Ok(code)
}

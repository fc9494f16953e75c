//! robot-sim CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use robot_sim::credentials::HttpCredentialProvisioner;
use robot_sim::engine_runner;
use robot_sim::lifecycle::{LaunchRequest, LifecycleManager};
use robot_sim::probe::bridge;
use robot_sim::registry::ExecutionRegistry;
use robot_sim::script::{transform, ScriptDocument};
use robot_sim::{FixSuggestion, SimConfig, SimError, StepMode};

#[derive(Parser)]
#[command(name = "robot-sim")]
#[command(about = "Run robot automation scripts with step-level event streaming")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize a script, run the engine on it and wait
    Run {
        /// Path to the script JSON
        script: PathBuf,

        /// Process key the run is registered under
        #[arg(short, long)]
        process_key: String,

        /// Pause after every step until continueStep arrives
        #[arg(long)]
        step: bool,

        /// Connection key to provision credentials for (repeatable)
        #[arg(short, long = "connection-key")]
        connection_keys: Vec<String>,
    },

    /// Host the probe protocol for an engine listener (callbacks on stdin)
    Listen,

    /// Run a JSON script through the engine, transforming concurrent blocks
    RunJson {
        /// Path to the script JSON
        file: PathBuf,

        /// Arguments passed through to the engine
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        engine_args: Vec<String>,
    },

    /// Print the transformed form of a script
    Transform {
        /// Path to the script JSON
        file: PathBuf,

        /// Listener reference passed to parallel branches
        #[arg(short, long, default_value = "")]
        listener: String,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    // `listen` keeps stdout for callback replies
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match SimConfig::load() {
        Ok(config) => {
            let config = config.with_env();
            match cli.command {
                Commands::Run {
                    script,
                    process_key,
                    step,
                    connection_keys,
                } => run_script(&config, &script, process_key, step, connection_keys).await,
                Commands::Listen => listen(config).await,
                Commands::RunJson { file, engine_args } => {
                    let robot = config.engine.robot_program.clone();
                    tokio::task::spawn_blocking(move || {
                        engine_runner::run_json(&robot, &file, &engine_args)
                    })
                    .await
                    .map_err(|e| SimError::Worker(e.to_string()))
                    .and_then(|r| r)
                }
                Commands::Transform { file, listener } => transform_file(&file, &listener),
            }
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            std::process::exit(1);
        }
    }
}

async fn run_script(
    config: &SimConfig,
    script: &Path,
    process_key: String,
    step: bool,
    connection_keys: Vec<String>,
) -> Result<i32, SimError> {
    let text = tokio::fs::read_to_string(script).await?;
    ScriptDocument::from_json(&text)?;

    let workspace = config.workspace_dir();
    let provisioner = HttpCredentialProvisioner::new(
        &config.reporting.ws_url,
        config.credentials.service_key.clone(),
        workspace.join(robot_sim::script::materialize::DEVDATA_DIR),
        config.credential_timeout(),
    )?;
    let manager = LifecycleManager::new(config, ExecutionRegistry::new(), Arc::new(provisioner));
    let script_path = manager.materializer().write(&process_key, &text)?;
    let step_mode = if step { StepMode::Step } else { StepMode::All };

    println!(
        "{} Running {} as {} ({} mode)",
        "→".cyan(),
        script_path.display().to_string().cyan(),
        process_key.cyan().bold(),
        step_mode
    );

    let report = manager
        .spawn(LaunchRequest {
            script_path,
            process_key,
            step_mode,
            execution_id: Uuid::new_v4().to_string(),
            connection_keys,
        })
        .await?;

    let label = if report.return_code == 0 {
        "✓".green()
    } else {
        "✗".red()
    };
    println!(
        "{} Engine exited with code {} (pid {})",
        label, report.return_code, report.pid
    );
    Ok(report.return_code)
}

async fn listen(config: SimConfig) -> Result<i32, SimError> {
    tokio::task::spawn_blocking(move || bridge::run(&config))
        .await
        .map_err(|e| SimError::Worker(e.to_string()))?
}

fn transform_file(file: &Path, listener: &str) -> Result<i32, SimError> {
    let text = std::fs::read_to_string(file)?;
    let doc = ScriptDocument::from_json(&text)?;
    let transformed = transform(&doc, listener)?;
    println!("{}", transformed.to_json_pretty()?);
    Ok(0)
}

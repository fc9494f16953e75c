//! Simulation service: the contract offered to a request layer
//!
//! Owns the replace policy: a submit for a key with a live execution stops
//! that execution before starting the new one. Submits are serialized by a
//! lock so two submits for one key can never both register.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SimConfig;
use crate::credentials::HttpCredentialProvisioner;
use crate::error::{Result, SimError};
use crate::lifecycle::{LaunchRequest, LifecycleManager};
use crate::registry::{ExecutionRegistry, ExecutionStatus};
use crate::script::{validate_process_key, ScriptDocument};
use crate::types::StepMode;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub process_key: String,
    /// Script document as JSON text
    pub script: String,
    pub step_mode: StepMode,
    pub connection_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub execution_id: String,
    pub process_id: String,
    pub robot_file: String,
    pub pid: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotRunning {
    pub process_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    Active(ExecutionStatus),
    NotRunning(NotRunning),
}

impl StatusReport {
    pub fn is_active(&self) -> bool {
        matches!(self, StatusReport::Active(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveList {
    pub processes: Vec<ExecutionStatus>,
    pub total: usize,
}

pub struct SimulationService {
    lifecycle: LifecycleManager,
    submit_lock: Mutex<()>,
}

impl SimulationService {
    /// Service with the HTTP credential provisioner from `config`
    pub fn new(config: &SimConfig) -> Result<Self> {
        let workspace = config.workspace_dir();
        let provisioner = HttpCredentialProvisioner::new(
            &config.reporting.ws_url,
            config.credentials.service_key.clone(),
            workspace.join(crate::script::materialize::DEVDATA_DIR),
            config.credential_timeout(),
        )?;
        let lifecycle =
            LifecycleManager::new(config, ExecutionRegistry::new(), Arc::new(provisioner));
        Ok(Self::with_lifecycle(lifecycle))
    }

    pub fn with_lifecycle(lifecycle: LifecycleManager) -> Self {
        Self {
            lifecycle,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Start a run for `process_key`, replacing any live one
    ///
    /// Returns once the engine is running; completion is observed through
    /// [`query_status`](Self::query_status) and the event stream.
    #[instrument(skip(self, request), fields(process_key = %request.process_key, step_mode = %request.step_mode))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        validate_process_key(&request.process_key)?;
        ScriptDocument::from_json(&request.script)?;

        let _guard = self.submit_lock.lock().await;

        if self.lifecycle.registry().contains(&request.process_key) {
            info!("Stopping live execution before replacing it");
            self.stop_blocking(&request.process_key).await?;
        }

        let script_path = self
            .lifecycle
            .materializer()
            .write(&request.process_key, &request.script)?;
        let execution_id = Uuid::new_v4().to_string();

        let handle = self
            .lifecycle
            .launch(LaunchRequest {
                script_path: script_path.clone(),
                process_key: request.process_key.clone(),
                step_mode: request.step_mode,
                execution_id: execution_id.clone(),
                connection_keys: request.connection_keys,
            })
            .await?;

        tokio::spawn(async move {
            match handle.completion.await {
                Ok(report) => info!(
                    process_id = %report.process_id,
                    execution_id = %report.execution_id,
                    return_code = report.return_code,
                    "Execution finished"
                ),
                Err(e) => error!(error = %e, "Execution worker failed"),
            }
        });

        Ok(SubmitReceipt {
            execution_id,
            process_id: request.process_key,
            robot_file: script_path.display().to_string(),
            pid: handle.pid,
            message: format!("Robot execution started in {} mode", request.step_mode),
        })
    }

    pub fn query_status(&self, process_key: &str) -> StatusReport {
        match self.lifecycle.status(process_key) {
            Some(status) => StatusReport::Active(status),
            None => StatusReport::NotRunning(NotRunning {
                process_id: process_key.to_string(),
                status: "not_running".to_string(),
                message: "No active process for this process_id".to_string(),
            }),
        }
    }

    /// Stop the run for `process_key`; succeeds when nothing is running
    #[instrument(skip(self))]
    pub async fn request_stop(&self, process_key: &str) -> Result<StopOutcome> {
        let not_running = || StopOutcome {
            success: true,
            message: format!(
                "Process {} is not running (may have already finished)",
                process_key
            ),
            execution_id: None,
        };

        let Some(execution) = self.lifecycle.registry().lookup(process_key) else {
            return Ok(not_running());
        };
        let execution_id = execution.execution_id.clone();

        if self.stop_blocking(process_key).await? {
            Ok(StopOutcome {
                success: true,
                message: format!("Process {} terminated", process_key),
                execution_id: Some(execution_id),
            })
        } else {
            Ok(not_running())
        }
    }

    pub fn list_active(&self) -> ActiveList {
        let processes = self.lifecycle.list();
        ActiveList {
            total: processes.len(),
            processes,
        }
    }

    async fn stop_blocking(&self, process_key: &str) -> Result<bool> {
        let lifecycle = self.lifecycle.clone();
        let key = process_key.to_string();
        tokio::task::spawn_blocking(move || lifecycle.stop(&key))
            .await
            .map_err(|e| SimError::Worker(e.to_string()))?
            .inspect_err(|e| warn!(error = %e, "Stop failed"))
    }
}

impl std::fmt::Debug for SimulationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationService")
            .field("registry", self.lifecycle.registry())
            .finish()
    }
}

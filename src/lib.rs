//! robot-sim - simulation runner for robot automation scripts

pub mod config;
pub mod credentials;
pub mod engine_runner;
pub mod error;
pub mod lifecycle;
pub mod probe;
pub mod registry;
pub mod script;
pub mod service;
pub mod types;

pub use config::SimConfig;
pub use credentials::{CredentialProvisioner, CredentialScope, HttpCredentialProvisioner};
pub use error::{FixSuggestion, Result, SimError};
pub use lifecycle::{ExitReport, LaunchRequest, LifecycleManager};
pub use probe::{Callback, Event, EventKind, StepGate, StepProtocol};
pub use registry::{Execution, ExecutionRegistry, ExecutionStatus};
pub use script::{transform, ScriptDocument, ScriptMaterializer};
pub use service::{SimulationService, StatusReport, StopOutcome, SubmitRequest};
pub use types::{RunState, StepMode};

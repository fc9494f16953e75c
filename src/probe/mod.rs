//! In-process probe: engine callbacks → numbered events → observer
//!
//! Runs inside the spawned engine process: the engine loads the Python
//! listener shim from [`shim`], which starts `robot-sim listen` and feeds
//! it callbacks. The host passes identity through the environment
//! variables below.

pub mod bridge;
pub mod channel;
pub mod event;
pub mod gate;
pub mod listener;
pub mod packet;
pub mod shim;

/// Observer base URL (`http(s)://…`)
pub const ENV_WS_URL: &str = "PROBE_WS_URL";
/// Path appended to the observer URL
pub const ENV_SOCKET_PATH: &str = "PROBE_SOCKET_PATH";
/// `all` | `step`
pub const ENV_STEP_MODE: &str = "STEP_MODE";
pub const ENV_PROCESS_ID: &str = "PROCESS_ID";
/// `robot-sim` binary the listener shim starts as `<bin> listen`
pub const ENV_BRIDGE: &str = "ROBOT_SIM_BRIDGE";

pub use channel::{ChannelConfig, OfflineReporter, Reporter, ReportingChannel};
pub use event::{Callback, EngineStatus, Event, EventKind, Status};
pub use gate::StepGate;
pub use listener::{AbortHandler, Flow, ProtocolState, StepProtocol};

//! Probe event and engine callback types
//!
//! [`Callback`] is what the engine hands the probe (one tagged variant per
//! lifecycle hook). [`Event`] is what the probe reports: a numbered,
//! timestamped envelope around an [`EventKind`].
//!
//! Wire shape of an event (kind fields are flattened next to the envelope):
//!
//! ```json
//! {"seq":3,"ts":"2026-01-01T00:00:00.000000Z","processId":"P1",
//!  "type":"STEP_START","step":{"id":"Log","name":"Log"},"data":{"lib":"BuiltIn","args":["hi"]}}
//! ```

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome reported on *_END events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Success,
    Error,
}

/// Status values the engine reports in callbacks
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIP")]
    Skip,
    #[serde(rename = "NOT RUN")]
    NotRun,
    /// Missing or unrecognised status
    #[default]
    #[serde(other)]
    Unknown,
}

impl EngineStatus {
    pub fn is_fail(&self) -> bool {
        matches!(self, EngineStatus::Fail)
    }
}

impl From<&EngineStatus> for Status {
    fn from(status: &EngineStatus) -> Self {
        if *status == EngineStatus::Pass {
            Status::Success
        } else {
            Status::Error
        }
    }
}

/// One log line, as buffered on a step frame and reported in STEP_LOG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRef {
    pub id: String,
    pub name: String,
}

impl StepRef {
    pub fn named(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEndData {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartData {
    pub lib: Option<String>,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEndData {
    pub duration_ms: Option<u64>,
    pub message: Option<String>,
    pub args: Vec<Value>,
    pub logs: Vec<LogEntry>,
}

/// Event payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RunStart {
        suite: SuiteRef,
    },
    RunEnd {
        suite: SuiteRef,
        status: Status,
    },
    TestStart {
        test: TestRef,
    },
    TestEnd {
        test: TestRef,
        status: Status,
        data: TestEndData,
    },
    StepStart {
        step: StepRef,
        data: StepStartData,
    },
    StepEnd {
        step: StepRef,
        status: Status,
        data: StepEndData,
    },
    StepLog {
        data: LogEntry,
    },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::RunStart { .. } => "RUN_START",
            EventKind::RunEnd { .. } => "RUN_END",
            EventKind::TestStart { .. } => "TEST_START",
            EventKind::TestEnd { .. } => "TEST_END",
            EventKind::StepStart { .. } => "STEP_START",
            EventKind::StepEnd { .. } => "STEP_END",
            EventKind::StepLog { .. } => "STEP_LOG",
        }
    }
}

/// Numbered event as sent over the reporting channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: String,
    #[serde(rename = "processId")]
    pub process_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(seq: u64, process_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            seq,
            ts: timestamp(),
            process_id: process_id.into(),
            kind,
        }
    }
}

/// Current UTC time, ISO-8601 with trailing `Z`
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Engine lifecycle callback, tagged by `callback`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "callback", rename_all = "snake_case")]
pub enum Callback {
    SuiteStart {
        #[serde(default)]
        name: String,
        #[serde(default)]
        source: Option<String>,
    },
    SuiteEnd {
        #[serde(default)]
        name: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        status: EngineStatus,
    },
    TestStart {
        name: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    TestEnd {
        name: String,
        #[serde(default)]
        status: EngineStatus,
        #[serde(default)]
        message: String,
    },
    KeywordStart {
        name: String,
        #[serde(default)]
        kwname: Option<String>,
        #[serde(default)]
        libname: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
    },
    KeywordEnd {
        name: String,
        #[serde(default)]
        kwname: Option<String>,
        #[serde(default)]
        status: EngineStatus,
        #[serde(default)]
        args: Vec<Value>,
    },
    LogMessage {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
}

/// Suite display name: explicit name, else source base name, else empty
pub fn suite_display_name(name: &str, source: Option<&str>) -> String {
    if !name.is_empty() {
        return name.to_string();
    }
    source
        .and_then(|s| Path::new(s).file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Step display name: `kwname` when present, else `name`
pub fn step_display_name<'a>(name: &'a str, kwname: Option<&'a str>) -> &'a str {
    match kwname {
        Some(kw) if !kw.is_empty() => kw,
        _ => name,
    }
}

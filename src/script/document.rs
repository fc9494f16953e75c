//! Script document model
//!
//! Typed view over the engine's JSON suite format. Only the parts the
//! transformer reasons about are typed; everything else rides along in
//! `extra` maps and verbatim statement values so a document survives a
//! parse/serialize cycle without losing fields.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, SimError};

/// Statement `type` marking a concurrent block
pub const PARALLEL_TYPE: &str = "PARALLEL";

/// Top-level suite document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Resource::is_empty")]
    pub resource: Resource,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resource section: library imports and suite variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    #[serde(rename = "type", default = "default_import_type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default = "default_test_name")]
    pub name: String,
    #[serde(default)]
    pub body: Vec<Statement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One node of a test body
///
/// Concurrent blocks are typed; any other node is kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Parallel(ParallelBlock),
    Other(Value),
}

/// A concurrent block: ordered branches meant to run simultaneously
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBlock {
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub body: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_import_type() -> String {
    "LIBRARY".to_string()
}

fn default_test_name() -> String {
    "Main".to_string()
}

impl ScriptDocument {
    /// Parse a document from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SimError::InvalidScript {
            reason: e.to_string(),
        })
    }

    /// Serialize as pretty JSON (2-space indent, UTF-8 preserved)
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// True if any test body holds a concurrent block
    pub fn has_parallel_blocks(&self) -> bool {
        self.tests
            .iter()
            .any(|t| t.body.iter().any(Statement::is_parallel))
    }

    /// Number of concurrent blocks across all tests
    pub fn parallel_block_count(&self) -> usize {
        self.tests
            .iter()
            .flat_map(|t| t.body.iter())
            .filter(|s| s.is_parallel())
            .count()
    }
}

impl Resource {
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty() && self.variables.is_empty() && self.extra.is_empty()
    }
}

impl Import {
    pub fn library(name: impl Into<String>) -> Self {
        Self {
            kind: default_import_type(),
            name: name.into(),
            extra: Map::new(),
        }
    }
}

impl Variable {
    /// Placeholder rows the editor emits for unnamed variables
    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty() || self.name == "${}"
    }
}

impl Statement {
    pub fn is_parallel(&self) -> bool {
        matches!(self, Statement::Parallel(_))
    }
}

impl Serialize for Statement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Statement::Other(value) => value.serialize(serializer),
            Statement::Parallel(block) => {
                let mut map = match serde_json::to_value(block) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => Map::new(),
                    Err(e) => return Err(serde::ser::Error::custom(e)),
                };
                map.insert("type".to_string(), Value::String(PARALLEL_TYPE.to_string()));
                Value::Object(map).serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Statement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let is_parallel = value.get("type").and_then(Value::as_str) == Some(PARALLEL_TYPE);
        if !is_parallel {
            return Ok(Statement::Other(value));
        }

        let mut value = value;
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
        }
        serde_json::from_value(value)
            .map(Statement::Parallel)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "name": "Suite",
            "resource": {
                "imports": [{"type": "LIBRARY", "name": "RPA.Browser"}],
                "variables": [{"name": "${URL}", "value": ["https://x"]}]
            },
            "tests": [{
                "name": "Flow",
                "body": [
                    {"type": "keyword", "name": "Log", "args": ["hi"]},
                    {"type": "PARALLEL", "branches": [
                        {"body": [{"name": "A"}]},
                        {"body": [{"name": "B"}]}
                    ]}
                ]
            }]
        })
    }

    #[test]
    fn parses_parallel_and_plain_statements() {
        let doc: ScriptDocument = serde_json::from_value(sample()).unwrap();
        assert_eq!(doc.tests.len(), 1);
        let body = &doc.tests[0].body;
        assert!(!body[0].is_parallel());
        match &body[1] {
            Statement::Parallel(block) => assert_eq!(block.branches.len(), 2),
            other => panic!("expected parallel, got {:?}", other),
        }
        assert!(doc.has_parallel_blocks());
        assert_eq!(doc.parallel_block_count(), 1);
    }

    #[test]
    fn parallel_statement_serializes_with_type_tag() {
        let doc: ScriptDocument = serde_json::from_value(sample()).unwrap();
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["tests"][0]["body"][1]["type"], "PARALLEL");
        assert_eq!(back["tests"][0]["body"][1]["branches"][1]["body"][0]["name"], "B");
        assert_eq!(back, sample());
    }

    #[test]
    fn unknown_fields_survive() {
        let doc: ScriptDocument = serde_json::from_value(json!({
            "name": "S",
            "settings": {"timeout": 3},
            "tests": [{"name": "T", "tags": ["x"], "body": []}]
        }))
        .unwrap();
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["settings"]["timeout"], 3);
        assert_eq!(back["tests"][0]["tags"][0], "x");
    }

    #[test]
    fn no_parallel_detected() {
        let doc = ScriptDocument::from_json(
            r#"{"name": "S", "tests": [{"name": "T", "body": [{"name": "Log"}]}]}"#,
        )
        .unwrap();
        assert!(!doc.has_parallel_blocks());
    }

    #[test]
    fn invalid_json_is_invalid_script() {
        let err = ScriptDocument::from_json("{not json").unwrap_err();
        assert!(matches!(err, SimError::InvalidScript { .. }));
    }

    #[test]
    fn placeholder_variables() {
        let empty = Variable {
            name: String::new(),
            value: Value::Null,
            extra: Map::new(),
        };
        let braces = Variable {
            name: "${}".into(),
            ..empty.clone()
        };
        let real = Variable {
            name: "${X}".into(),
            ..empty.clone()
        };
        assert!(empty.is_placeholder());
        assert!(braces.is_placeholder());
        assert!(!real.is_placeholder());
    }
}

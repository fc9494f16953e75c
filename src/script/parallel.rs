//! Parallel block transformer
//!
//! Rewrites every concurrent block of a script into a single call of the
//! engine's `Run Parallel` keyword. Branches, suite variables and imports
//! are passed as JSON text arguments with the engine's variable sigils
//! escaped, so the enclosing suite does not resolve them before the parallel
//! library sees them.
//!
//! ```text
//! PARALLEL                       Run Parallel
//!   branch: [A, B]        →        [{"name":"Branch_1","body":[A,B]},
//!   branch: [C]                     {"name":"Branch_2","body":[C]}]
//!                                  {"${URL}":"https://..."}
//!                                  <listener>
//!                                  [{"type":"LIBRARY","name":"RPA.Parallel"}]
//! ```
//!
//! The transform is pure and idempotent: a document without concurrent
//! blocks comes back unchanged.

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::document::{Import, ParallelBlock, ScriptDocument, Statement, TestCase, Variable};
use crate::error::Result;

/// Keyword provided by the parallel-execution library
pub const RUN_PARALLEL_KEYWORD: &str = "Run Parallel";
/// Library that provides [`RUN_PARALLEL_KEYWORD`]
pub const PARALLEL_LIBRARY: &str = "RPA.Parallel";

/// Deployment-only libraries and their local equivalents
const LIBRARY_ALIASES: &[(&str, &str)] = &[("RPA.Cloud.Google", "RPA.Google")];

/// Engine variable sigils (scalar, list, dict)
const SIGILS: &[&str] = &["${", "@{", "&{"];

#[derive(Serialize)]
struct BranchPayload<'a> {
    name: String,
    body: &'a [Value],
}

/// Transform a document, rewriting concurrent blocks for the engine
///
/// Returns a clone of the input when no concurrent block is present.
pub fn transform(doc: &ScriptDocument, listener: &str) -> Result<ScriptDocument> {
    if !doc.has_parallel_blocks() {
        return Ok(doc.clone());
    }

    let imports = normalize_imports(&doc.resource.imports);
    let variables: Vec<Variable> = doc
        .resource
        .variables
        .iter()
        .filter(|v| !v.is_placeholder())
        .cloned()
        .collect();

    let tests = doc
        .tests
        .iter()
        .map(|test| {
            let body = test
                .body
                .iter()
                .map(|stmt| match stmt {
                    Statement::Parallel(block) => {
                        run_parallel_call(block, &variables, listener, &imports)
                            .map(Statement::Other)
                    }
                    Statement::Other(_) => Ok(stmt.clone()),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(TestCase {
                name: test.name.clone(),
                body,
                extra: test.extra.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut resource = doc.resource.clone();
    resource.imports = imports;
    resource.variables = variables;

    Ok(ScriptDocument {
        name: Some(
            doc.name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Main".to_string()),
        ),
        resource,
        tests,
        extra: doc.extra.clone(),
    })
}

/// Replace deployment-only libraries and ensure exactly one parallel import
pub fn normalize_imports(imports: &[Import]) -> Vec<Import> {
    let mut out: Vec<Import> = Vec::with_capacity(imports.len() + 1);
    let mut has_parallel = false;

    for import in imports {
        let mut import = import.clone();
        if let Some((_, local)) = LIBRARY_ALIASES.iter().find(|(from, _)| *from == import.name) {
            import.name = (*local).to_string();
        }
        if import.name == PARALLEL_LIBRARY {
            if has_parallel {
                continue;
            }
            has_parallel = true;
        }
        out.push(import);
    }

    if !has_parallel {
        out.push(Import::library(PARALLEL_LIBRARY));
    }
    out
}

/// Build the `Run Parallel` keyword call for one concurrent block
fn run_parallel_call(
    block: &ParallelBlock,
    variables: &[Variable],
    listener: &str,
    imports: &[Import],
) -> Result<Value> {
    let branches: Vec<BranchPayload<'_>> = block
        .branches
        .iter()
        .enumerate()
        .map(|(i, branch)| BranchPayload {
            name: format!("Branch_{}", i + 1),
            body: &branch.body,
        })
        .collect();

    let branches_json = escape_sigils(&serde_json::to_string(&branches)?);
    let variables_json = escape_sigils(&serde_json::to_string(&variable_map(variables))?);
    let imports_json = escape_sigils(&serde_json::to_string(imports)?);

    Ok(json!({
        "type": "keyword",
        "name": RUN_PARALLEL_KEYWORD,
        "args": [branches_json, variables_json, listener, imports_json],
    }))
}

/// Variable name → value; single-element lists collapse to the scalar
pub fn variable_map(variables: &[Variable]) -> Map<String, Value> {
    let mut map = Map::new();
    for var in variables {
        let value = match &var.value {
            Value::Null => Value::Array(Vec::new()),
            Value::Array(items) if items.len() == 1 => items[0].clone(),
            other => other.clone(),
        };
        map.insert(var.name.clone(), value);
    }
    map
}

/// Escape engine variable sigils so they reach the parallel library literally
pub fn escape_sigils(text: &str) -> String {
    SIGILS.iter().fold(text.to_string(), |acc, sigil| {
        acc.replace(sigil, &format!("\\{}", sigil))
    })
}

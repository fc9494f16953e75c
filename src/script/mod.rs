//! Script handling: document model, materialization, parallel rewrite

pub mod document;
pub mod materialize;
pub mod parallel;

pub use document::{Branch, Import, ParallelBlock, ScriptDocument, Statement, TestCase, Variable};
pub use materialize::{validate_process_key, ScriptMaterializer};
pub use parallel::transform;

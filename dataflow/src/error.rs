//! Error taxonomy shared by analysis, the variable store and task execution.
//!
//! Errors are `Clone` because a single failure is fanned out to every
//! variable downstream of the task that produced it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A variable was settled more than once.
    #[error("variable `{variable}` is assigned more than once")]
    DoubleAssignment { variable: String },

    /// A variable has no reachable producer, or producers form a cycle.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// External command exited nonzero or did not create an expected output.
    #[error("task `{task}` failed: {reason}")]
    ProcessFailure { task: String, reason: String },

    /// Two live variables mapped to the same file.
    #[error("mapping collision: {} is already mapped by `{owner}`", path.display())]
    MappingCollision { path: PathBuf, owner: String },

    /// Value shape or expression type does not match the declared type.
    #[error("type mismatch for `{context}`: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("task `{task}` timed out after {after:?}")]
    TimedOut { task: String, after: Duration },

    /// Malformed procedure, call or argument binding.
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// A pure function rejected its resolved arguments.
    #[error("expression error: {0}")]
    Expression(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl EngineError {
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidProgram(message.into())
    }

    pub fn mismatch(
        context: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::TypeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn io(context: impl std::fmt::Display, err: &std::io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }

    /// Short stable name of the error class, used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DoubleAssignment { .. } => "double_assignment",
            Self::Dependency(_) => "dependency",
            Self::ProcessFailure { .. } => "process_failure",
            Self::MappingCollision { .. } => "mapping_collision",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Cancelled => "cancelled",
            Self::TimedOut { .. } => "timed_out",
            Self::InvalidProgram(_) => "invalid_program",
            Self::Expression(_) => "expression",
            Self::Io(_) => "io",
        }
    }
}

/// Errors compare by class and message; used when comparing variable states.
impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.to_string() == other.to_string()
    }
}

//! Error types for the grading engine.

use std::path::PathBuf;

/// Errors produced while loading checks or handling a grading request.
///
/// Failures caused by the submitted source never show up here: those are
/// classified into an [`Outcome`](crate::Outcome) by the executor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No check is registered under the requested id.
    #[error("check not found: {0}")]
    CheckNotFound(String),

    /// The requested id names a group of checks, which cannot be graded directly.
    #[error("`{id}` names a group of checks: {}", checks.join(", "))]
    GroupNotGradeable {
        /// The group id.
        id: String,
        /// Ids of the member checks.
        checks: Vec<String>,
    },

    /// The request was rejected before execution.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A test bank path does not exist.
    #[error("test bank path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    /// A test bank file could not be parsed.
    #[error("failed to parse test bank file {}: {source}", path.display())]
    BankParse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A check definition is not usable.
    #[error("invalid check `{id}`: {reason}")]
    InvalidCheck {
        /// Id of the offending check.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The same id or alias is registered twice.
    #[error("duplicate check id `{id}` in {}", path.display())]
    DuplicateCheck {
        /// The duplicated id or alias.
        id: String,
        /// File containing the second definition.
        path: PathBuf,
    },

    /// A reload was requested on a registry built in memory.
    #[error("registry was not created from a test bank")]
    NoTestBank,

    /// The sandbox could not be prepared or started.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

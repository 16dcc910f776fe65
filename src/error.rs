//! Error taxonomy for a single execution.
//!
//! Every failed invocation surfaces exactly one [`ExecutionError`]. Cleanup
//! failures that happen while unwinding a failed invocation are logged and
//! never replace the primary error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by a container runtime backend.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The unit does not exist (never created, or already removed).
    #[error("container {0} not found")]
    NotFound(String),
    /// The unit is in a state that does not allow the operation
    /// (e.g. killing a container that is not running).
    #[error("container {name} conflict: {message}")]
    Conflict { name: String, message: String },
    /// Any other API failure, tagged with the operation that failed.
    #[error("{op} failed: {message}")]
    Api { op: &'static str, message: String },
    /// Malformed or truncated data on the attached stream.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn api(op: &'static str, message: impl ToString) -> Self {
        Self::Api {
            op,
            message: message.to_string(),
        }
    }

    /// True when the unit is already gone, which teardown treats as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Failures of the ephemeral workspace (and of the profile lookup that
/// precedes it).
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),
    #[error("invalid source file name: {0:?}")]
    InvalidFileName(String),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Discriminant of [`ExecutionError`], for callers that only care about
/// the category (exit codes, reply formatting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    WorkspaceError,
}

/// The single failure outcome of an invocation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The deadline expired; the unit has already been force-removed.
    #[error("time limit exceeded ({}ms elapsed, limit {}ms)", elapsed.as_millis(), limit.as_millis())]
    TimeLimitExceeded { elapsed: Duration, limit: Duration },
    /// The runtime reported the unit was OOM-killed.
    #[error("memory limit exceeded ({limit_mb} MB)")]
    MemoryLimitExceeded { limit_mb: u64 },
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TimeLimitExceeded { .. } => ErrorKind::TimeLimitExceeded,
            Self::MemoryLimitExceeded { .. } => ErrorKind::MemoryLimitExceeded,
            Self::Runtime(_) => ErrorKind::RuntimeError,
            Self::Workspace(_) => ErrorKind::WorkspaceError,
        }
    }
}

//! One-shot sandboxed code execution.
//!
//! [`Executor::run`] takes a language key, a source payload and stdin bytes,
//! runs the payload in a throwaway container (no network, memory ceiling,
//! read-only workspace, wall-clock deadline) and returns its stdout/stderr,
//! or exactly one [`ExecutionError`]. Whatever happens, the workspace and
//! the container are gone by the time the outcome is returned.

pub mod backoff;
pub mod config;
pub mod deadline;
pub mod demux;
pub mod error;
pub mod executor;
pub mod languages;
pub mod orchestrator;
pub mod runtime;
pub mod workspace;

pub use config::Config;
pub use error::{ErrorKind, ExecutionError, RuntimeError, WorkspaceError};
pub use executor::{Executor, RunOptions, RunRequest, RunResult};
pub use languages::{LanguageProfile, LanguageRegistry};
pub use runtime::{ContainerRuntime, DockerRuntime};

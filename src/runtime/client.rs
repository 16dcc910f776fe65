//! `ContainerRuntime`: the seam between an invocation and the container engine.
//!
//! The orchestrator only talks to this trait, so the Docker backend can be
//! swapped for a test double. Units are addressed by the name chosen before
//! `create`, which lets teardown reach a unit whose create call was cut
//! short by the deadline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

use crate::demux::Frame;
use crate::error::RuntimeError;

/// Access mode of the workspace bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    /// Suffix used in Docker bind strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl BindMount {
    /// `host:container:mode`, as Docker's `Binds` expects.
    pub fn to_bind_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode.as_str()
        )
    }
}

/// Everything needed to create one execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub bind: BindMount,
    pub memory_bytes: i64,
    pub network_disabled: bool,
    pub cap_add: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Post-mortem state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inspection {
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
}

/// Both halves of an attached unit: demultiplexed output and the
/// program's stdin. Closing `input` delivers EOF to the program.
pub struct Attached {
    pub output: BoxStream<'static, Result<Frame, RuntimeError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for Attached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attached").finish_non_exhaustive()
    }
}

/// Container engine operations used by one invocation.
///
/// Implementations must be usable concurrently from many invocations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates (but does not start) a unit. Returns the engine's id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Attaches stdin/stdout/stderr. Must be called before `start` so no
    /// early output is lost.
    async fn attach(&self, name: &str) -> Result<Attached, RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Blocks until the unit stops and returns its exit status.
    async fn wait(&self, name: &str) -> Result<i64, RuntimeError>;

    async fn inspect(&self, name: &str) -> Result<Inspection, RuntimeError>;

    /// Kills a running unit. A unit that is not running yields
    /// [`RuntimeError::Conflict`], a missing one [`RuntimeError::NotFound`].
    async fn kill(&self, name: &str) -> Result<(), RuntimeError>;

    /// Removes a unit in any state (killing it if needed).
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Names of all units, running or not, that carry `label`
    /// (`key` or `key=value`).
    async fn list(&self, label: &str) -> Result<Vec<String>, RuntimeError>;
}

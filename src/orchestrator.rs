//! Execution unit lifecycle: provision → attach → start → wait → inspect →
//! teardown.
//!
//! Every runtime call on the execution path goes through the invocation's
//! [`Deadline`]. Teardown does not: it must run to completion after the
//! deadline has fired.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::ExecutorConfig;
use crate::deadline::Deadline;
use crate::demux::Demultiplexer;
use crate::error::{ExecutionError, RuntimeError};
use crate::executor::RunOptions;
use crate::languages::LanguageProfile;
use crate::runtime::{Attached, BindMount, ContainerRuntime, ContainerSpec, MountMode};
use crate::workspace::Workspace;

/// Label carried by every unit, valued with the invocation id.
pub const INVOCATION_LABEL: &str = "golfbox.invocation";

/// Prefix of unit names.
const UNIT_PREFIX: &str = "golfbox-";

/// Environment variable telling the image's entrypoint where to write the
/// trace log.
const TRACE_ENV: &str = "STRACE_OUTPUT_PATH";

/// Capability the tracer needs.
const TRACE_CAPABILITY: &str = "SYS_PTRACE";

/// Entrypoint flag that dumps a disassembly instead of plain execution.
const DISASM_FLAG: &str = "-d";

/// Lifecycle of one execution unit, as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Name reserved, nothing asked of the engine yet.
    Pending,
    /// `create` issued; the engine may or may not have the unit.
    Creating,
    Created,
    Attached,
    Running,
    Exited,
    Removed,
}

/// One isolated unit, owned by exactly one invocation.
///
/// Dropping a unit that was created but never torn down schedules a forced
/// teardown on the current Tokio runtime.
pub struct ExecutionUnit {
    name: String,
    invocation: Uuid,
    state: UnitState,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExecutionUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invocation(&self) -> Uuid {
        self.invocation
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    fn transition(&mut self, next: UnitState) {
        debug!("Unit {}: {:?} → {:?}", self.name, self.state, next);
        self.state = next;
    }

    /// True while the engine may hold resources for this unit.
    fn is_live(&self) -> bool {
        !matches!(self.state, UnitState::Pending | UnitState::Removed)
    }
}

impl std::fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        if !self.is_live() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Unit {} dropped outside a runtime, it may leak", self.name);
            return;
        };
        warn!("Unit {} dropped while {:?}, forcing teardown", self.name, self.state);
        let runtime = Arc::clone(&self.runtime);
        let name = self.name.clone();
        let may_appear = self.state == UnitState::Creating;
        handle.spawn(async move {
            if let Err(e) = force_remove(runtime.as_ref(), &name, may_appear).await {
                warn!("Teardown of dropped unit {name} failed: {e}");
            }
        });
    }
}

/// What a unit left behind after running to completion.
#[derive(Debug)]
pub struct Completion {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub oom_killed: bool,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ExecutorConfig,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ExecutorConfig) -> Self {
        Self { runtime, settings }
    }

    /// Reserves a fresh unit name. Nothing is created yet.
    pub fn reserve(&self) -> ExecutionUnit {
        let invocation = Uuid::new_v4();
        ExecutionUnit {
            name: format!("{UNIT_PREFIX}{invocation}"),
            invocation,
            state: UnitState::Pending,
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Builds the creation spec: no network, memory ceiling, workspace
    /// mounted read-only unless tracing, fixed entry command.
    pub fn container_spec(
        &self,
        unit: &ExecutionUnit,
        profile: &LanguageProfile,
        workspace: &Workspace,
        options: RunOptions,
    ) -> Result<ContainerSpec, RuntimeError> {
        let memory_bytes = profile.memory_limit_bytes().ok_or_else(|| {
            RuntimeError::api(
                "create",
                format!("memory limit of {} MB is out of range", profile.memory_limit_mb),
            )
        })?;
        let mount = self.settings.mount_path.trim_end_matches('/');

        let mut cmd = vec![self.settings.entrypoint.clone()];
        if options.disasm {
            cmd.push(DISASM_FLAG.to_string());
        }
        cmd.push(format!("{mount}/{}", profile.file_name));

        let (env, cap_add, mode) = if options.trace {
            (
                vec![format!("{TRACE_ENV}={}", self.settings.trace_log_path())],
                vec![TRACE_CAPABILITY.to_string()],
                MountMode::ReadWrite,
            )
        } else {
            (Vec::new(), Vec::new(), MountMode::ReadOnly)
        };

        Ok(ContainerSpec {
            name: unit.name.clone(),
            image: profile.image.clone(),
            cmd,
            env,
            bind: BindMount {
                host_path: workspace.path().to_path_buf(),
                container_path: mount.to_string(),
                mode,
            },
            memory_bytes,
            network_disabled: true,
            cap_add,
            labels: HashMap::from([(
                INVOCATION_LABEL.to_string(),
                unit.invocation.to_string(),
            )]),
        })
    }

    pub async fn provision(
        &self,
        unit: &mut ExecutionUnit,
        spec: &ContainerSpec,
        deadline: &Deadline,
    ) -> Result<(), ExecutionError> {
        unit.transition(UnitState::Creating);
        match deadline.guard(self.runtime.create(spec)).await {
            Ok(id) => {
                debug!("Unit {} created (id {id})", unit.name);
                unit.transition(UnitState::Created);
                Ok(())
            }
            // Interrupted mid-call: the engine may still materialize the unit
            Err(err @ ExecutionError::TimeLimitExceeded { .. }) => Err(err),
            // The engine answered, and it refused
            Err(err) => {
                unit.transition(UnitState::Pending);
                Err(err)
            }
        }
    }

    /// Attaches, starts, feeds stdin, drains output and waits for the unit
    /// to stop, then inspects it.
    pub async fn run(
        &self,
        unit: &mut ExecutionUnit,
        stdin: &[u8],
        deadline: &Deadline,
    ) -> Result<Completion, ExecutionError> {
        // Attach before start, or early output is lost
        let Attached { output, mut input } =
            deadline.guard(self.runtime.attach(&unit.name)).await?;
        unit.transition(UnitState::Attached);

        deadline.guard(self.runtime.start(&unit.name)).await?;
        unit.transition(UnitState::Running);

        let mut demux = Demultiplexer::new();
        let name = unit.name.as_str();
        let feed = async {
            match write_stdin(&mut input, stdin).await {
                Ok(()) => Ok(()),
                // The program exited without reading all of its input
                Err(e) if is_closed_pipe(&e) => {
                    debug!("Unit {name} closed stdin early: {e}");
                    Ok(())
                }
                Err(e) => Err(RuntimeError::from(e)),
            }
        };
        let exit_code = deadline
            .guard(async {
                let (_, _, code) =
                    tokio::try_join!(demux.drain(output), feed, self.runtime.wait(name))?;
                Ok::<_, RuntimeError>(code)
            })
            .await?;
        unit.transition(UnitState::Exited);

        let inspection = deadline.guard(self.runtime.inspect(&unit.name)).await?;
        let (stdout, stderr) = demux.assemble();
        debug!(
            "Unit {} exited with {exit_code} (oom: {}, {} bytes stdout, {} bytes stderr)",
            unit.name,
            inspection.oom_killed,
            stdout.len(),
            stderr.len()
        );

        Ok(Completion {
            stdout,
            stderr,
            exit_code: inspection.exit_code.unwrap_or(exit_code),
            oom_killed: inspection.oom_killed,
        })
    }

    /// Removes the unit. With `forced`, kills it first and retries while it
    /// settles. Idempotent: a unit already removed, or never created, is a
    /// no-op.
    pub async fn teardown(
        &self,
        unit: &mut ExecutionUnit,
        forced: bool,
    ) -> Result<(), RuntimeError> {
        if !unit.is_live() {
            unit.transition(UnitState::Removed);
            return Ok(());
        }

        let result = if forced {
            force_remove(self.runtime.as_ref(), &unit.name, unit.state == UnitState::Creating)
                .await
        } else {
            match self.runtime.remove(&unit.name).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => {
                    warn!("Removal of {} failed ({e}), forcing", unit.name);
                    force_remove(self.runtime.as_ref(), &unit.name, false).await
                }
            }
        };

        if result.is_ok() {
            unit.transition(UnitState::Removed);
        }
        result
    }
}

async fn write_stdin(
    input: &mut std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    stdin: &[u8],
) -> std::io::Result<()> {
    input.write_all(stdin).await?;
    input.shutdown().await
}

fn is_closed_pipe(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

/// Kill then remove, retrying on the teardown backoff schedule.
///
/// `may_appear` is set when a `create` call was interrupted: the engine can
/// still materialize the unit, so "not found" is retried too.
async fn force_remove(
    runtime: &dyn ContainerRuntime,
    name: &str,
    may_appear: bool,
) -> Result<(), RuntimeError> {
    let mut backoff = Backoff::for_teardown();
    loop {
        match runtime.kill(name).await {
            Ok(()) => debug!("Unit {name} killed"),
            // Not started, already exited, or already gone
            Err(RuntimeError::Conflict { .. }) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => debug!("Kill of {name} failed: {e}"),
        }

        let err = match runtime.remove(name).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() && !may_appear => return Ok(()),
            Err(e) => e,
        };

        if backoff.exhausted() {
            if err.is_not_found() {
                debug!("Unit {name} never materialized");
                return Ok(());
            }
            return Err(err);
        }
        let delay = backoff.next_delay();
        debug!(
            "Teardown of {name} not done ({err}), retrying in {}ms (attempt {})",
            delay.as_millis(),
            backoff.attempt
        );
        tokio::time::sleep(delay).await;
    }
}

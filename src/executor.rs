//! The execution API: `run(language, source, stdin)` → output or one typed
//! error.
//!
//! Resource release is centralized in [`Executor::run`]: whatever path the
//! execution takes, the unit is torn down (forced on any failure) and the
//! workspace removed exactly once, before the outcome is returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ExecutorConfig;
use crate::deadline::Deadline;
use crate::error::ExecutionError;
use crate::languages::{LanguageProfile, LanguageRegistry};
use crate::orchestrator::{ExecutionUnit, Orchestrator};
use crate::runtime::ContainerRuntime;
use crate::workspace::Workspace;

/// Optional execution modes. Both off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Mount the workspace read-write, grant ptrace and point the image's
    /// tracer at a log file inside the mount.
    pub trace: bool,
    /// Ask the entrypoint for a disassembly.
    pub disasm: bool,
}

/// One execution request. Consumed by [`Executor::run`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub language: String,
    pub source: Vec<u8>,
    pub stdin: Vec<u8>,
    pub options: RunOptions,
}

impl RunRequest {
    pub fn new(
        language: impl Into<String>,
        source: impl Into<Vec<u8>>,
        stdin: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: stdin.into(),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// Output of a program that finished within its limits. A non-zero exit is
/// still a result; only OOM kills and timeouts are errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub elapsed: Duration,
}

pub struct Executor {
    orchestrator: Orchestrator,
    languages: LanguageRegistry,
    settings: ExecutorConfig,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        languages: LanguageRegistry,
        settings: ExecutorConfig,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(runtime, settings.clone()),
            languages,
            settings,
        }
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunResult, ExecutionError> {
        // Unknown languages are rejected before anything is provisioned
        let profile = self.languages.lookup(&request.language)?;
        let mut workspace = Workspace::acquire(
            self.settings.workspace_dir.as_deref(),
            profile,
            &request.source,
        )?;
        let mut unit = self.orchestrator.reserve();

        info!(
            "Running {} in {} ({} bytes source, {} bytes stdin, trace: {}, disasm: {})",
            request.language,
            unit.name(),
            request.source.len(),
            request.stdin.len(),
            request.options.trace,
            request.options.disasm,
        );

        let deadline = Deadline::after(self.settings.timeout());
        let outcome = self
            .execute(&mut unit, profile, &workspace, &request, &deadline)
            .await;
        let outcome = self.release(outcome, &mut unit, &mut workspace).await;

        match &outcome {
            Ok(result) => info!(
                "{} finished: exit {} in {}ms ({} bytes stdout, {} bytes stderr)",
                unit.name(),
                result.exit_code,
                result.elapsed.as_millis(),
                result.stdout.len(),
                result.stderr.len()
            ),
            Err(e) => info!("{} failed: {e}", unit.name()),
        }
        outcome
    }

    async fn execute(
        &self,
        unit: &mut ExecutionUnit,
        profile: &LanguageProfile,
        workspace: &Workspace,
        request: &RunRequest,
        deadline: &Deadline,
    ) -> Result<RunResult, ExecutionError> {
        let spec = self
            .orchestrator
            .container_spec(unit, profile, workspace, request.options)?;
        self.orchestrator.provision(unit, &spec, deadline).await?;
        let completion = self.orchestrator.run(unit, &request.stdin, deadline).await?;

        if completion.oom_killed {
            return Err(ExecutionError::MemoryLimitExceeded {
                limit_mb: profile.memory_limit_mb,
            });
        }
        Ok(RunResult {
            stdout: completion.stdout,
            stderr: completion.stderr,
            exit_code: completion.exit_code,
            elapsed: deadline.elapsed(),
        })
    }

    /// Tears down the unit and removes the workspace. On a failed outcome
    /// cleanup errors are only logged; on success they become the outcome,
    /// since something was left behind.
    async fn release(
        &self,
        outcome: Result<RunResult, ExecutionError>,
        unit: &mut ExecutionUnit,
        workspace: &mut Workspace,
    ) -> Result<RunResult, ExecutionError> {
        let forced = outcome.is_err();
        let teardown = self.orchestrator.teardown(unit, forced).await;
        let cleanup = workspace.release();

        match outcome {
            Ok(result) => {
                teardown?;
                cleanup?;
                Ok(result)
            }
            Err(err) => {
                if let Err(e) = teardown {
                    warn!("Teardown of {} failed after {err}: {e}", unit.name());
                }
                if let Err(e) = cleanup {
                    warn!("Workspace cleanup failed after {err}: {e}");
                }
                Err(err)
            }
        }
    }
}

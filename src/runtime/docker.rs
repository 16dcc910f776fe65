//! Docker Engine backend, on top of bollard.
//!
//! Units are created TTY-less with stdin open once, so the attached
//! connection carries the multiplexed stdout/stderr framing that bollard
//! decodes into `LogOutput` chunks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::{future, StreamExt};
use tracing::debug;

use super::client::{Attached, ContainerRuntime, ContainerSpec, Inspection};
use crate::config::DockerConfig;
use crate::demux::{Frame, StreamKind};
use crate::error::RuntimeError;

/// Docker's value for `HostConfig.NetworkMode` that gives a unit no
/// interfaces besides loopback.
const NETWORK_MODE_NONE: &str = "none";

/// Container engine reached through the Docker Engine API.
///
/// `Docker` is a cheap handle over a pooled HTTP client; one instance is
/// shared by all concurrent invocations.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(config: &DockerConfig) -> anyhow::Result<Self> {
        let docker = match config.socket.as_deref() {
            Some(socket) => Docker::connect_with_socket(
                socket,
                config.connect_timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?
                .with_timeout(Duration::from_secs(config.connect_timeout_secs)),
        };
        Ok(Self { docker })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::api("ping", e))
    }
}

/// Maps engine errors on a named unit: 404 and 409 get their own variants
/// so teardown can tell "already gone" and "not running" apart.
fn map_error(op: &'static str, name: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(name.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict {
            name: name.to_string(),
            message,
        },
        other => RuntimeError::api(op, other),
    }
}

fn to_frame(
    item: Result<LogOutput, BollardError>,
    name: &str,
) -> Option<Result<Frame, RuntimeError>> {
    match item {
        Ok(LogOutput::StdOut { message }) => Some(Ok(Frame::new(StreamKind::Stdout, message))),
        Ok(LogOutput::StdErr { message }) => Some(Ok(Frame::new(StreamKind::Stderr, message))),
        // Only produced with a TTY, which then carries everything as stdout
        Ok(LogOutput::Console { message }) => {
            Some(Ok(Frame::new(StreamKind::Stdout, message)))
        }
        Ok(LogOutput::StdIn { .. }) => None,
        Err(e) => Some(Err(map_error("attach", name, e))),
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(false),
        network_disabled: Some(spec.network_disabled),
        host_config: Some(HostConfig {
            binds: Some(vec![spec.bind.to_bind_string()]),
            memory: Some(spec.memory_bytes),
            // Same as memory: no swap, so exceeding the ceiling is an OOM kill
            memory_swap: Some(spec.memory_bytes),
            cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
            network_mode: spec
                .network_disabled
                .then(|| NETWORK_MODE_NONE.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        // A 404 here means a missing image, not a missing unit
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| RuntimeError::api("create", e))?;
        for warning in &response.warnings {
            debug!("Docker warning for {}: {warning}", spec.name);
        }
        Ok(response.id)
    }

    async fn attach(&self, name: &str) -> Result<Attached, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| map_error("attach", name, e))?;

        let name = name.to_string();
        let output = output
            .filter_map(move |item| future::ready(to_frame(item, &name)))
            .boxed();
        Ok(Attached { output, input })
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start", name, e))
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut statuses = Box::pin(self.docker.wait_container(name, Some(options)));
        match statuses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error("wait", name, e)),
            None => Err(RuntimeError::api("wait", "status stream ended without a status")),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Inspection, RuntimeError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect", name, e))?;
        let state = info.state.unwrap_or_default();
        Ok(Inspection {
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| map_error("kill", name, e))
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| map_error("remove", name, e))
    }

    async fn list(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::api("list", e))?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect())
    }
}

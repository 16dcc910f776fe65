use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};

use crate::languages::{LanguageProfile, LanguageRegistry};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub languages: BTreeMap<String, LanguageProfile>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Unix socket of the Docker daemon. Uses the local defaults
    /// (DOCKER_HOST or /var/run/docker.sock) when unset.
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock limit for one execution, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Where the workspace is mounted inside the container
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    /// Entry command of the images; receives the source path as last argument
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    /// Parent directory of the workspaces (system temp dir when unset).
    /// Must be visible to the Docker daemon at the same path.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Trace log file name, relative to the mount
    #[serde(default = "default_trace_log")]
    pub trace_log: String,
}

fn default_connect_timeout_secs() -> u64 {
    120
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_mount_path() -> String {
    "/volume".to_string()
}

fn default_entrypoint() -> String {
    "script".to_string()
}

fn default_trace_log() -> String {
    "strace.log".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            mount_path: default_mount_path(),
            entrypoint: default_entrypoint(),
            workspace_dir: None,
            trace_log: default_trace_log(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Path of the trace log as seen from inside the container
    pub fn trace_log_path(&self) -> String {
        format!("{}/{}", self.mount_path.trim_end_matches('/'), self.trace_log)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {path}"))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${DOCKER_SOCKET}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.languages.is_empty() {
            bail!("no languages configured");
        }
        if self.executor.timeout_ms == 0 {
            bail!("executor.timeout_ms must be greater than zero");
        }
        if !self.executor.mount_path.starts_with('/') {
            bail!(
                "executor.mount_path must be absolute, got {:?}",
                self.executor.mount_path
            );
        }
        for (key, profile) in &self.languages {
            profile
                .validate_file_name()
                .map_err(|e| anyhow!("language {key}: {e}"))?;
            if profile.memory_limit_mb == 0 {
                bail!("language {key}: memory_limit_mb must be greater than zero");
            }
            if profile.memory_limit_bytes().is_none() {
                bail!("language {key}: memory_limit_mb is too large");
            }
            if profile.image.trim().is_empty() {
                bail!("language {key}: image is empty");
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> LanguageRegistry {
        LanguageRegistry::new(self.languages.clone())
    }
}

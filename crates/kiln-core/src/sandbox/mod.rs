//! Ephemeral sandbox execution for untrusted generated code.
//!
//! A [`SandboxBackend`] is the thin container-engine surface (native API or
//! CLI); the [`SandboxRunner`] drives one run end to end on top of it:
//! workspace materialization, container lifecycle, timeout, teardown and
//! artifact collection.

use crate::config::BackendPreference;
use crate::errors::SandboxError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod docker_api;
pub mod docker_cli;
pub mod runner;

pub use docker_api::DockerApiBackend;
pub use docker_cli::DockerCliBackend;
pub use runner::{RunResult, SandboxRunner, SandboxSettings};

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory bind-mounted read-write at `work_dir`
    pub host_dir: PathBuf,
    pub work_dir: String,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit: Option<f64>,
    pub network_disabled: bool,
}

impl ContainerSpec {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host_dir.display(), self.work_dir)
    }

    /// Memory limit in bytes, clamped to what the Docker API accepts
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        self.memory_limit_mb.map(|mb| {
            let bytes = mb.saturating_mul(1024 * 1024);
            i64::try_from(bytes).unwrap_or(i64::MAX)
        })
    }
}

/// Captured container streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub containers_deleted: usize,
    pub images_deleted: usize,
    pub space_reclaimed: u64,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), SandboxError>;

    async fn image_exists(&self, tag: &str) -> Result<bool, SandboxError>;

    /// Build `tag` from a directory holding a `Dockerfile` and its context
    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<(), SandboxError>;

    /// Returns the container id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn start_container(&self, id: &str) -> Result<(), SandboxError>;

    /// Block until the container exits and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError>;

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs, SandboxError>;

    /// Force removal (kills a running container). Removing an unknown
    /// container succeeds.
    async fn remove_container(&self, id: &str) -> Result<(), SandboxError>;

    /// Remove stopped containers and dangling images
    async fn prune(&self) -> Result<PruneReport, SandboxError>;
}

/// Pick a reachable backend according to the preference
pub async fn detect(preference: BackendPreference) -> Result<Arc<dyn SandboxBackend>, SandboxError> {
    let mut failures = Vec::new();

    if preference != BackendPreference::Cli {
        match DockerApiBackend::connect() {
            Ok(api) => match api.ping().await {
                Ok(()) => {
                    log::info!("Using Docker API sandbox backend");
                    return Ok(Arc::new(api));
                }
                Err(e) => failures.push(format!("api: {}", e)),
            },
            Err(e) => failures.push(format!("api: {}", e)),
        }
    }

    if preference != BackendPreference::Api {
        match DockerCliBackend::locate() {
            Ok(cli) => match cli.ping().await {
                Ok(()) => {
                    log::info!("Using Docker CLI sandbox backend ({})", cli.program().display());
                    return Ok(Arc::new(cli));
                }
                Err(e) => failures.push(format!("cli: {}", e)),
            },
            Err(e) => failures.push(format!("cli: {}", e)),
        }
    }

    Err(SandboxError::Unavailable(failures.join("; ")))
}

use super::{ContainerLogs, ContainerSpec, SandboxBackend};
use crate::capabilities::{FileMap, RunOutputs};
use crate::config::SandboxConfig;
use crate::environment::EnvironmentRef;
use crate::errors::SandboxError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{Builder, TempDir};
use tokio::fs;
use uuid::Uuid;

/// Outcome of one sandbox run. A program that fails is still a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub produced_files: FileMap,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
}

impl RunResult {
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            stderr: format!("Timeout: execution exceeded {}s", timeout.as_secs_f64()),
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn outputs(&self) -> RunOutputs {
        RunOutputs {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

/// Container layout and limits for every run
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub work_dir: String,
    pub entry_point: String,
    pub error_file: String,
    pub interpreter: String,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit: Option<f64>,
    pub network_disabled: bool,
}

impl From<&SandboxConfig> for SandboxSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            entry_point: config.entry_point.clone(),
            error_file: config.error_file.clone(),
            interpreter: config.interpreter.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit: config.cpu_limit,
            network_disabled: config.network_disabled,
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl SandboxSettings {
    /// Workspace path for an input file; the entry point and error file are reserved
    pub fn input_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let relative = workspace_path(name)?;
        if relative == Path::new(&self.entry_point) || relative == Path::new(&self.error_file) {
            return Err(SandboxError::ReservedWorkspacePath(name.to_string()));
        }
        Ok(relative)
    }

    /// Check every input name before any work is spent on them
    pub fn validate_inputs(&self, input_files: &FileMap) -> Result<(), SandboxError> {
        for name in input_files.keys() {
            self.input_path(name)?;
        }
        Ok(())
    }

    /// Program stderr goes to the error file so it survives the container
    pub fn command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "{} {} 2> {}",
                self.interpreter, self.entry_point, self.error_file
            ),
        ]
    }
}

enum Execution {
    Exited { exit_code: i64, logs: ContainerLogs },
    TimedOut,
}

/// Removes the container when released, or from a spawned task if dropped
/// without release.
struct ContainerGuard {
    backend: Arc<dyn SandboxBackend>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(backend: Arc<dyn SandboxBackend>, id: String) -> Self {
        Self {
            backend,
            id: Some(id),
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.backend.remove_container(&id).await {
                log::warn!("Failed to remove sandbox container {}: {}", id, e);
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.remove_container(&id).await {
                        log::warn!("Deferred removal of container {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => log::error!("No runtime to remove sandbox container {}", id),
        }
    }
}

/// Runs code in a fresh container per call
#[derive(Clone)]
pub struct SandboxRunner {
    backend: Arc<dyn SandboxBackend>,
    settings: SandboxSettings,
}

impl SandboxRunner {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: SandboxSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        code: &str,
        input_files: &FileMap,
        environment: &EnvironmentRef,
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        let workspace = self.materialize(code, input_files).await?;

        let spec = ContainerSpec {
            name: format!("kiln-run-{}", Uuid::new_v4()),
            image: environment.image.clone(),
            command: self.settings.command(),
            host_dir: workspace.path().to_path_buf(),
            work_dir: self.settings.work_dir.clone(),
            memory_limit_mb: self.settings.memory_limit_mb,
            cpu_limit: self.settings.cpu_limit,
            network_disabled: self.settings.network_disabled,
        };

        let id = self.backend.create_container(&spec).await?;
        log::debug!("Created sandbox container {} from {}", id, spec.image);

        let guard = ContainerGuard::new(self.backend.clone(), id.clone());
        let execution = self.execute(&id, timeout).await;
        guard.release().await;

        match execution? {
            Execution::TimedOut => Ok(RunResult::timed_out(timeout)),
            Execution::Exited { exit_code, logs } => {
                let stderr = self.compose_stderr(workspace.path(), &logs.stderr).await;
                let produced_files = self.collect_produced(workspace.path()).await?;
                Ok(RunResult {
                    stdout: logs.stdout,
                    stderr,
                    produced_files,
                    exit_code: Some(exit_code),
                    timed_out: false,
                })
            }
        }
    }

    async fn execute(&self, id: &str, timeout: Duration) -> Result<Execution, SandboxError> {
        self.backend.start_container(id).await?;

        match tokio::time::timeout(timeout, self.backend.wait_container(id)).await {
            Ok(exit) => {
                let exit_code = exit?;
                let logs = self.backend.container_logs(id).await?;
                Ok(Execution::Exited { exit_code, logs })
            }
            Err(_) => {
                log::warn!(
                    "Execution timed out for container {} after {:?}",
                    id,
                    timeout
                );
                Ok(Execution::TimedOut)
            }
        }
    }

    async fn materialize(&self, code: &str, input_files: &FileMap) -> Result<TempDir, SandboxError> {
        let workspace = Builder::new().prefix("kiln-run-").tempdir()?;

        // Container users other than root must be able to write artifacts
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(workspace.path(), std::fs::Permissions::from_mode(0o777)).await?;
        }

        for (name, bytes) in input_files {
            let relative = self.settings.input_path(name)?;
            let target = workspace.path().join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, bytes).await?;
        }

        fs::write(workspace.path().join(&self.settings.entry_point), code.as_bytes()).await?;

        Ok(workspace)
    }

    async fn compose_stderr(&self, root: &Path, container_stderr: &str) -> String {
        let mut stderr = match fs::read(root.join(&self.settings.error_file)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };

        if !container_stderr.is_empty() {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(container_stderr);
        }
        stderr
    }

    async fn collect_produced(&self, root: &Path) -> Result<FileMap, SandboxError> {
        let mut files = FileMap::new();
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key == self.settings.entry_point || key == self.settings.error_file {
                    continue;
                }

                files.insert(key, fs::read(&path).await?);
            }
        }

        Ok(files)
    }
}

/// Validate a caller-supplied file name as a path inside the workspace
pub fn workspace_path(name: &str) -> Result<PathBuf, SandboxError> {
    let path = Path::new(name);
    let mut relative = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(SandboxError::InvalidWorkspacePath(name.to_string())),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(SandboxError::InvalidWorkspacePath(name.to_string()));
    }
    Ok(relative)
}

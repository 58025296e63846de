// src/sandbox/docker_cli.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use which::which;

use super::{ContainerLogs, ContainerSpec, PruneReport, SandboxBackend};
use crate::errors::SandboxError;

/// Sandbox backend shelling out to the `docker` binary, used when the
/// engine socket is not reachable through the native API.
pub struct DockerCliBackend {
    program: PathBuf,
}

impl DockerCliBackend {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Find `docker` on PATH
    pub fn locate() -> Result<Self, SandboxError> {
        let program = which("docker")
            .map_err(|e| SandboxError::Unavailable(format!("docker binary not found: {}", e)))?;
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn output(&self, args: &[String]) -> Result<Output, SandboxError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    /// Run and require success, returning trimmed stdout
    async fn run(&self, args: &[String]) -> Result<String, SandboxError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(Self::failure(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn failure(args: &[String], output: &Output) -> SandboxError {
        SandboxError::Cli {
            command: format!("docker {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    fn is_missing(output: &Output) -> bool {
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        stderr.contains("no such")
    }

    fn is_prune_conflict(output: &Output) -> bool {
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        stderr.contains("already running")
    }

    pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "-v".to_string(),
            spec.bind(),
            "-w".to_string(),
            spec.work_dir.clone(),
        ];

        if let Some(mb) = spec.memory_limit_mb {
            args.extend(["--memory".to_string(), format!("{}m", mb)]);
        }
        if let Some(cpus) = spec.cpu_limit {
            args.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        if spec.network_disabled {
            args.extend(["--network".to_string(), "none".to_string()]);
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Count deleted objects in `docker ... prune -f` output
    pub(crate) fn count_pruned(stdout: &str) -> usize {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| {
                line.starts_with("deleted:")
                    || (line.len() == 64 && line.chars().all(|c| c.is_ascii_hexdigit()))
            })
            .count()
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[async_trait]
impl SandboxBackend for DockerCliBackend {
    fn name(&self) -> &'static str {
        "docker-cli"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.run(&args(&["info", "--format", "{{.ServerVersion}}"]))
            .await
            .map(|_| ())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, SandboxError> {
        let argv = args(&["image", "inspect", tag]);
        let output = self.output(&argv).await?;
        if output.status.success() {
            Ok(true)
        } else if Self::is_missing(&output) {
            Ok(false)
        } else {
            Err(Self::failure(&argv, &output))
        }
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<(), SandboxError> {
        let mut argv = args(&["build", "--rm", "--force-rm", "-t", tag]);
        argv.push(context_dir.display().to_string());

        let output = self.output(&argv).await?;
        if !output.status.success() {
            return Err(SandboxError::BuildFailed {
                tag: tag.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        self.run(&Self::create_args(spec)).await
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.run(&args(&["start", id])).await.map(|_| ())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        let stdout = self.run(&args(&["wait", id])).await?;
        stdout.parse::<i64>().map_err(|e| SandboxError::ContainerWait {
            id: id.to_string(),
            reason: format!("unexpected `docker wait` output '{}': {}", stdout, e),
        })
    }

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs, SandboxError> {
        let argv = args(&["logs", id]);
        let output = self.output(&argv).await?;
        if !output.status.success() {
            return Err(Self::failure(&argv, &output));
        }
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let argv = args(&["rm", "-f", "-v", id]);
        let output = self.output(&argv).await?;
        if output.status.success() || Self::is_missing(&output) {
            Ok(())
        } else {
            Err(Self::failure(&argv, &output))
        }
    }

    async fn prune(&self) -> Result<PruneReport, SandboxError> {
        let mut report = PruneReport::default();

        for (kind, argv) in [
            ("container", args(&["container", "prune", "-f"])),
            ("image", args(&["image", "prune", "-f"])),
        ] {
            let output = self.output(&argv).await?;
            if !output.status.success() {
                if Self::is_prune_conflict(&output) {
                    return Err(SandboxError::PruneConflict);
                }
                return Err(Self::failure(&argv, &output));
            }

            let count = Self::count_pruned(&String::from_utf8_lossy(&output.stdout));
            match kind {
                "container" => report.containers_deleted = count,
                _ => report.images_deleted = count,
            }
        }

        Ok(report)
    }
}

// src/test_utils/mock_backend.rs
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::SandboxError;
use crate::sandbox::{ContainerLogs, ContainerSpec, PruneReport, SandboxBackend};

const ENTRY_POINT: &str = "script.py";
const ERROR_FILE: &str = ".kiln_stderr.log";

/// What the mock container sees when it starts
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub image: String,
    pub code: String,
    pub workspace_files: Vec<String>,
}

/// Scripted behaviour of one mock container
#[derive(Debug, Clone, Default)]
pub struct MockRun {
    exit_code: i64,
    stdout: String,
    container_stderr: String,
    error_file: Option<String>,
    files: Vec<(String, Vec<u8>)>,
    hang: bool,
}

impl MockRun {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    /// Never exits; only a timeout ends it
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout = text.to_string();
        self
    }

    pub fn container_stderr(mut self, text: &str) -> Self {
        self.container_stderr = text.to_string();
        self
    }

    /// Contents the program writes to its redirected stderr
    pub fn error_file(mut self, text: &str) -> Self {
        self.error_file = Some(text.to_string());
        self
    }

    pub fn file(mut self, name: &str, bytes: &[u8]) -> Self {
        self.files.push((name.to_string(), bytes.to_vec()));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub images: HashSet<String>,
    pub builds: Vec<String>,
    pub build_contexts: Vec<HashMap<String, String>>,
    pub created: Vec<ContainerSpec>,
    pub container_ids: Vec<String>,
    pub invocations: Vec<MockInvocation>,
    pub removed: Vec<String>,
    pub prune_calls: usize,
}

type Responder = Box<dyn Fn(&MockInvocation) -> MockRun + Send + Sync>;

/// In-memory container engine that executes a responder closure instead of
/// real code, while still reading and writing the bind-mounted workspace.
pub struct MockBackend {
    responder: Responder,
    state: Mutex<MockState>,
    specs: Mutex<HashMap<String, ContainerSpec>>,
    runs: Mutex<HashMap<String, MockRun>>,
    build_delay: Mutex<Duration>,
    fail_builds: AtomicBool,
    fail_creates: AtomicBool,
    fail_starts: AtomicBool,
    prune_conflicts: AtomicU32,
}

impl MockBackend {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&MockInvocation) -> MockRun + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            state: Mutex::new(MockState::default()),
            specs: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            build_delay: Mutex::new(Duration::ZERO),
            fail_builds: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
            fail_starts: AtomicBool::new(false),
            prune_conflicts: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> MockState {
        self.state.lock().unwrap().clone()
    }

    pub fn add_image(&self, tag: &str) {
        self.state.lock().unwrap().images.insert(tag.to_string());
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn set_prune_conflicts(&self, count: u32) {
        self.prune_conflicts.store(count, Ordering::SeqCst);
    }

    fn list_files(root: &Path) -> Vec<String> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        files
    }

    fn cli_error(command: &str) -> SandboxError {
        SandboxError::Cli {
            command: command.to_string(),
            stderr: "mock failure".to_string(),
        }
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, SandboxError> {
        Ok(self.state.lock().unwrap().images.contains(tag))
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<(), SandboxError> {
        let mut context = HashMap::new();
        for name in Self::list_files(context_dir) {
            let text = std::fs::read_to_string(context_dir.join(&name)).unwrap_or_default();
            context.insert(name, text);
        }
        {
            let mut state = self.state.lock().unwrap();
            state.builds.push(tag.to_string());
            state.build_contexts.push(context);
        }

        let delay = *self.build_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(SandboxError::BuildFailed {
                tag: tag.to_string(),
                reason: "pip install failed".to_string(),
            });
        }

        self.state.lock().unwrap().images.insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Self::cli_error("create"));
        }

        let mut state = self.state.lock().unwrap();
        let id = format!("mock-{}", state.container_ids.len());
        state.created.push(spec.clone());
        state.container_ids.push(id.clone());
        self.specs.lock().unwrap().insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(Self::cli_error("start"));
        }

        let spec = self
            .specs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Self::cli_error("start"))?;

        let invocation = MockInvocation {
            image: spec.image.clone(),
            code: std::fs::read_to_string(spec.host_dir.join(ENTRY_POINT)).unwrap_or_default(),
            workspace_files: Self::list_files(&spec.host_dir),
        };

        let run = (self.responder)(&invocation);

        if let Some(text) = &run.error_file {
            std::fs::write(spec.host_dir.join(ERROR_FILE), text)?;
        }
        for (name, bytes) in &run.files {
            let target = spec.host_dir.join(name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, bytes)?;
        }

        self.state.lock().unwrap().invocations.push(invocation);
        self.runs.lock().unwrap().insert(id.to_string(), run);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        let run = self.runs.lock().unwrap().get(id).cloned();
        match run {
            Some(run) if run.hang => std::future::pending().await,
            Some(run) => Ok(run.exit_code),
            None => Err(Self::cli_error("wait")),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs, SandboxError> {
        let runs = self.runs.lock().unwrap();
        let run = runs.get(id).ok_or_else(|| Self::cli_error("logs"))?;
        Ok(ContainerLogs {
            stdout: run.stdout.clone(),
            stderr: run.container_stderr.clone(),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        self.state.lock().unwrap().removed.push(id.to_string());
        Ok(())
    }

    async fn prune(&self) -> Result<PruneReport, SandboxError> {
        self.state.lock().unwrap().prune_calls += 1;

        let remaining = self.prune_conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.prune_conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::PruneConflict);
        }
        Ok(PruneReport::default())
    }
}

//! Process-wide wiring of the execution engine.
//!
//! The environment cache and job table live as long as the `Engine`; they
//! are created once at startup and never reset.

use crate::attempt::{AttemptController, RetryPolicy};
use crate::capabilities::Capabilities;
use crate::config::KilnConfig;
use crate::environment::EnvironmentCache;
use crate::errors::KilnError;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::progress::ProgressChannel;
use crate::sandbox::{self, SandboxBackend, SandboxRunner, SandboxSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sandbox health as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend: String,
    pub reachable: bool,
    pub base_image: String,
    pub base_image_present: bool,
    pub error: Option<String>,
}

pub struct Engine {
    config: KilnConfig,
    backend: Arc<dyn SandboxBackend>,
    cache: Arc<EnvironmentCache>,
    progress: Arc<ProgressChannel>,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Detect a sandbox backend and assemble the engine around it
    pub async fn start(config: KilnConfig, capabilities: Capabilities) -> Result<Self, KilnError> {
        config.validate()?;
        let backend = sandbox::detect(config.sandbox.backend).await?;
        Ok(Self::with_backend(config, backend, capabilities))
    }

    pub fn with_backend(
        config: KilnConfig,
        backend: Arc<dyn SandboxBackend>,
        capabilities: Capabilities,
    ) -> Self {
        let cache = Arc::new(EnvironmentCache::new(
            backend.clone(),
            &config.sandbox,
            &config.pruning,
        ));
        let runner = SandboxRunner::new(backend.clone(), SandboxSettings::from(&config.sandbox));
        let controller = AttemptController::new(
            runner,
            cache.clone(),
            capabilities.clone(),
            RetryPolicy::from(&config.retry),
            config.sandbox.timeout(),
        );

        let progress = Arc::new(ProgressChannel::new());
        let orchestrator = Orchestrator::new(
            controller,
            capabilities,
            progress.clone(),
            OrchestratorSettings {
                variants: config.jobs.variants,
                workspace: SandboxSettings::from(&config.sandbox),
            },
        );

        log::info!(
            "Engine ready: backend={}, variants={}, max_attempts={}, timeout={}s",
            backend.name(),
            config.jobs.variants,
            config.retry.max_attempts,
            config.sandbox.timeout_secs
        );

        Self {
            config,
            backend,
            cache,
            progress,
            orchestrator,
        }
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<EnvironmentCache> {
        &self.cache
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Probe the backend and the base image without building anything
    pub async fn health(&self) -> BackendHealth {
        let base_image = self.config.sandbox.base_image.clone();
        let mut health = BackendHealth {
            backend: self.backend.name().to_string(),
            reachable: false,
            base_image: base_image.clone(),
            base_image_present: false,
            error: None,
        };

        if let Err(e) = self.backend.ping().await {
            health.error = Some(e.to_string());
            return health;
        }
        health.reachable = true;

        match self.backend.image_exists(&base_image).await {
            Ok(present) => health.base_image_present = present,
            Err(e) => health.error = Some(e.to_string()),
        }
        health
    }
}

//! Configuration types for the execution engine

use crate::errors::KilnError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 1 TiB
pub const MAX_MEMORY_LIMIT_MB: u64 = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub pruning: PruningConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub server: ServerSettings,
}

/// Which container backend to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Native API first, CLI as fallback
    #[default]
    Auto,
    Api,
    Cli,
}

/// Sandbox and environment image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Dockerfile used to provision the base image when it is missing
    #[serde(default = "default_base_recipe")]
    pub base_recipe: String,

    /// Repository name for cached dependency images (`<repo>:<fingerprint>`)
    #[serde(default = "default_cache_repository")]
    pub cache_repository: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    #[serde(default = "default_error_file")]
    pub error_file: String,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Fractional CPU cores
    #[serde(default)]
    pub cpu_limit: Option<f64>,

    #[serde(default)]
    pub network_disabled: bool,

    #[serde(default)]
    pub backend: BackendPreference,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            base_recipe: default_base_recipe(),
            cache_repository: default_cache_repository(),
            timeout_secs: default_timeout_secs(),
            work_dir: default_work_dir(),
            entry_point: default_entry_point(),
            error_file: default_error_file(),
            interpreter: default_interpreter(),
            memory_limit_mb: None,
            cpu_limit: None,
            network_disabled: false,
            backend: BackendPreference::Auto,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry loop bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_code_fixes")]
    pub max_code_fixes: u32,
    #[serde(default = "default_error_history_window")]
    pub error_history_window: usize,
    #[serde(default = "default_output_excerpt_chars")]
    pub output_excerpt_chars: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_code_fixes: default_max_code_fixes(),
            error_history_window: default_error_history_window(),
            output_excerpt_chars: default_output_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_variants")]
    pub variants: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            variants: default_variants(),
        }
    }
}

/// Out-of-band cleanup of dangling images and stopped containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_prune_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_conflict_backoff_secs")]
    pub conflict_backoff_secs: u64,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_prune_interval_secs(),
            conflict_backoff_secs: default_conflict_backoff_secs(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

/// Gemini-backed reasoning service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_model")]
    pub model: String,

    /// Direct API key (discouraged, prefer `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_base_image() -> String { "kiln_executor:latest".to_string() }
fn default_base_recipe() -> String {
    "FROM python:3.11-slim\nWORKDIR /app\n".to_string()
}
fn default_cache_repository() -> String { "kiln_cache".to_string() }
fn default_timeout_secs() -> u64 { 60 }
fn default_work_dir() -> String { "/app".to_string() }
fn default_entry_point() -> String { "script.py".to_string() }
fn default_error_file() -> String { ".kiln_stderr.log".to_string() }
fn default_interpreter() -> String { "python".to_string() }
fn default_max_attempts() -> u32 { 10 }
fn default_max_code_fixes() -> u32 { 5 }
fn default_error_history_window() -> usize { 3 }
fn default_output_excerpt_chars() -> usize { 1000 }
fn default_variants() -> usize { 3 }
fn default_true() -> bool { true }
fn default_prune_interval_secs() -> u64 { 3600 }
fn default_conflict_backoff_secs() -> u64 { 5 }
fn default_max_conflict_retries() -> u32 { 3 }
fn default_model() -> String { "gemini-2.0-flash".to_string() }
fn default_api_key_env() -> String { "GEMINI_API_KEY".to_string() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_output_tokens() -> u32 { 8192 }
fn default_bind_addr() -> String { "127.0.0.1:8080".to_string() }

impl KilnConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.sandbox.base_image.is_empty() {
            return Err(KilnError::Config("Sandbox base_image cannot be empty".to_string()));
        }

        if self.sandbox.cache_repository.is_empty() {
            return Err(KilnError::Config("Sandbox cache_repository cannot be empty".to_string()));
        }

        if self.sandbox.cache_repository.contains(':') {
            return Err(KilnError::Config(format!(
                "Sandbox cache_repository '{}' must not contain a tag",
                self.sandbox.cache_repository
            )));
        }

        if self.sandbox.timeout_secs == 0 {
            return Err(KilnError::Config("Sandbox timeout_secs must be greater than 0".to_string()));
        }

        if self.sandbox.entry_point.is_empty() || self.sandbox.error_file.is_empty() {
            return Err(KilnError::Config(
                "Sandbox entry_point and error_file cannot be empty".to_string(),
            ));
        }

        if self.sandbox.entry_point == self.sandbox.error_file {
            return Err(KilnError::Config(
                "Sandbox entry_point and error_file must differ".to_string(),
            ));
        }

        if let Some(mb) = self.sandbox.memory_limit_mb {
            if mb == 0 || mb > MAX_MEMORY_LIMIT_MB {
                return Err(KilnError::Config(format!(
                    "Sandbox memory_limit_mb must be between 1 and {}",
                    MAX_MEMORY_LIMIT_MB
                )));
            }
        }

        if let Some(cpus) = self.sandbox.cpu_limit {
            if cpus <= 0.0 {
                return Err(KilnError::Config("Sandbox cpu_limit must be positive".to_string()));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(KilnError::Config("Retry max_attempts must be greater than 0".to_string()));
        }

        if self.retry.error_history_window == 0 {
            return Err(KilnError::Config(
                "Retry error_history_window must be greater than 0".to_string(),
            ));
        }

        if self.jobs.variants == 0 {
            return Err(KilnError::Config("Jobs variants must be greater than 0".to_string()));
        }

        if self.pruning.enabled && self.pruning.interval_secs == 0 {
            return Err(KilnError::Config(
                "Pruning interval_secs must be greater than 0 when pruning is enabled".to_string(),
            ));
        }

        if self.assistant.model.is_empty() {
            return Err(KilnError::Config("Assistant model cannot be empty".to_string()));
        }

        if self.server.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(KilnError::Config(format!(
                "Server bind_addr '{}' is not a valid socket address",
                self.server.bind_addr
            )));
        }

        Ok(())
    }
}

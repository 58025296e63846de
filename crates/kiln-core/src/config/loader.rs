//! Configuration loader for YAML files and environment overrides

use crate::config::types::*;
use crate::errors::KilnError;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_BIND_ADDR: &str = "KILN_BIND_ADDR";
pub const ENV_VARIANTS: &str = "KILN_VARIANTS";
pub const ENV_TIMEOUT_SECS: &str = "KILN_TIMEOUT_SECS";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<KilnConfig, KilnError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            KilnError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<KilnConfig, KilnError> {
        // An empty document deserializes to unit, not to a mapping
        let mut config: KilnConfig = if content.trim().is_empty() {
            KilnConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| KilnError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::apply_overrides(&mut config, |key| env::var(key).ok())?;

        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<KilnConfig, KilnError> {
        Self::from_str("")
    }

    /// Apply `KILN_*` overrides using the given lookup
    pub fn apply_overrides<F>(config: &mut KilnConfig, lookup: F) -> Result<(), KilnError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            log::debug!("Overriding server bind address from {}", ENV_BIND_ADDR);
            config.server.bind_addr = addr;
        }

        if let Some(raw) = lookup(ENV_VARIANTS) {
            config.jobs.variants = raw.trim().parse().map_err(|e| {
                KilnError::Config(format!("Invalid {} value '{}': {}", ENV_VARIANTS, raw, e))
            })?;
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            config.sandbox.timeout_secs = raw.trim().parse().map_err(|e| {
                KilnError::Config(format!("Invalid {} value '{}': {}", ENV_TIMEOUT_SECS, raw, e))
            })?;
        }

        Ok(())
    }

    /// Resolve the assistant API key from the config value or its env var
    pub fn resolve_api_key(assistant: &AssistantConfig) -> Option<String> {
        if let Some(key) = &assistant.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        env::var(&assistant.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

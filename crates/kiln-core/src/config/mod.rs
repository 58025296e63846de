//! Configuration module
//!
//! YAML configuration with per-field defaults and `KILN_*` environment
//! overrides. Every field is optional; an empty file yields the defaults.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::KilnError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<KilnConfig, KilnError> {
    ConfigLoader::from_file(path).await
}

/// Validate a configuration
pub fn validate_config(config: &KilnConfig) -> Result<(), KilnError> {
    config.validate()
}

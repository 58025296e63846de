//! Error types for the execution engine
//!
//! Errors are split by the layer that raises them. `SandboxError` covers the
//! isolation layer only: a program that crashes is a normal run, not an error.
//! `BuildError` is never fatal; callers fall back to the base environment.
//! `CapabilityError` covers the external reasoning service, and `KilnError`
//! is what the public engine surface returns.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Job {job_id} cannot be improved: {reason}")]
    InvalidJobState { job_id: String, reason: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(err.to_string())
    }
}

impl From<SandboxError> for KilnError {
    fn from(err: SandboxError) -> Self {
        KilnError::SandboxUnavailable(err.to_string())
    }
}

/// Failure of the isolation layer itself (could not create, start, wait on,
/// or remove a container).
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error("Docker CLI command `{command}` failed: {stderr}")]
    Cli { command: String, stderr: String },
    #[error("I/O error during sandbox operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid workspace path '{0}': input files must use relative paths")]
    InvalidWorkspacePath(String),
    #[error("Input file '{0}' would overwrite the program or its error log")]
    ReservedWorkspacePath(String),
    #[error("Image build failed for {tag}: {reason}")]
    BuildFailed { tag: String, reason: String },
    #[error("Waiting on container {id} failed: {reason}")]
    ContainerWait { id: String, reason: String },
    #[error("A prune operation is already running")]
    PruneConflict,
    #[error("No sandbox backend available: {0}")]
    Unavailable(String),
}

/// Environment image construction failed. The entry is not poisoned: the
/// next resolve for the same fingerprint builds again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Environment build failed for fingerprint {fingerprint}: {reason}")]
pub struct BuildError {
    pub fingerprint: String,
    pub reason: String,
}

/// Failure of a delegated capability (generation, refinement, classification,
/// ranking, report writing).
#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("Request to reasoning service failed: {0}")]
    Request(String),
    #[error("Reasoning service returned an error {status}: {message}")]
    Service { status: u16, message: String },
    #[error("Could not parse reasoning service answer: {0}")]
    Parse(String),
    #[error("Reasoning service returned an empty answer")]
    EmptyAnswer,
    #[error("Missing API key: {0}")]
    MissingApiKey(String),
}

impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        CapabilityError::Request(err.to_string())
    }
}

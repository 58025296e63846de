//! Sandboxed execution and self-healing retry engine for generated code.
//!
//! A caller submits a task and input files; the engine generates several
//! candidate programs, runs each inside an ephemeral container built from a
//! cached dependency image, and repairs failures until a variant runs
//! cleanly or its attempt budget is spent. Successful variants are ranked
//! and the winner is turned into a report.
//!
//! # Architecture Overview
//!
//! - **Environment cache**: dependency sets fingerprinted into image tags,
//!   built at most once per process with concurrent requests coalesced
//! - **Sandbox runner**: one container per run with a hard timeout and
//!   unconditional teardown, over the Docker API or the `docker` CLI
//! - **Attempt controller**: classify, fix dependencies or code, retry
//! - **Job orchestrator**: parallel variants, ranking, reporting, improvement
//! - **Progress channel**: per-job checklist events with snapshot replay
//! - **Capabilities**: the reasoning services behind generation and
//!   classification, with a Gemini implementation in [`assistant`]

pub mod assistant;
pub mod attempt;
pub mod capabilities;
pub mod config;
pub mod engine;
pub mod environment;
pub mod errors;
pub mod orchestrator;
pub mod progress;
pub mod sandbox;

pub use assistant::GeminiAssistant;
pub use attempt::{AttemptController, RetryPolicy, Variant, VariantOutcome};
pub use capabilities::{Capabilities, Classification, FileMap};
pub use config::*;
pub use engine::{BackendHealth, Engine};
pub use environment::{DependencySet, EnvironmentCache, EnvironmentRef, Fingerprint};
pub use errors::{BuildError, CapabilityError, KilnError, SandboxError};
pub use orchestrator::{FinalResult, Job, JobSnapshot, JobStatus, Orchestrator};
pub use progress::{EventKind, JobId, ProgressChannel, ProgressEvent, ProgressStream};
pub use sandbox::{RunResult, SandboxBackend, SandboxRunner};

#[cfg(test)]
pub mod test_utils;

//! External reasoning capabilities consumed by the engine.
//!
//! Code generation, refinement, error classification, ranking and report
//! writing are delegated through the narrow traits below. The engine never
//! builds prompts itself; it only hands over code, outputs and history.

use crate::errors::CapabilityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Workspace files keyed by `/`-separated relative path
pub type FileMap = BTreeMap<String, Vec<u8>>;

const PREVIEW_BYTES: usize = 1000;

/// Outcome class of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Ok,
    DependencyError,
    CodeError,
    BothError,
    UnknownError,
    Timeout,
    InfrastructureError,
}

impl Classification {
    /// Whether a code fix may be attempted for this outcome
    pub fn wants_code_fix(self) -> bool {
        matches!(
            self,
            Classification::CodeError | Classification::BothError | Classification::Timeout
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::Ok => "OK",
            Classification::DependencyError => "DEPENDENCY",
            Classification::CodeError => "CODE",
            Classification::BothError => "BOTH",
            Classification::UnknownError => "UNKNOWN",
            Classification::Timeout => "TIMEOUT",
            Classification::InfrastructureError => "INFRASTRUCTURE",
        };
        f.write_str(label)
    }
}

/// Initial code and dependency list from the generator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub code: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Output of the last run handed to refiners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutputs {
    pub stdout: String,
    pub stderr: String,
}

/// What the generator learns about an input file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub name: String,
    pub size: usize,
    /// First bytes of a UTF-8 file, `None` for binary content
    pub preview: Option<String>,
}

impl FileSummary {
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Self {
        let head = &bytes[..bytes.len().min(PREVIEW_BYTES)];
        let preview = match std::str::from_utf8(head) {
            Ok(text) => Some(text.to_string()),
            // A cut in the middle of a multi-byte char is still text
            Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => {
                Some(String::from_utf8_lossy(&head[..e.valid_up_to()]).into_owned())
            }
            Err(_) => None,
        };
        Self {
            name: name.to_string(),
            size: bytes.len(),
            preview,
        }
    }

    pub fn summarize(files: &FileMap) -> Vec<FileSummary> {
        files
            .iter()
            .map(|(name, bytes)| FileSummary::from_bytes(name, bytes))
            .collect()
    }

    /// One-paragraph rendering for prompts
    pub fn describe(&self) -> String {
        match &self.preview {
            Some(text) => format!("{} ({} bytes):\n{}", self.name, self.size, text),
            None => format!("{} ({} bytes): binary", self.name, self.size),
        }
    }
}

/// A successful variant offered to the ranker, with everything its run left
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingCandidate {
    pub variant: usize,
    pub code: String,
    pub dependencies: Vec<String>,
    pub outputs: RunOutputs,
    pub produced_files: FileMap,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate_candidate(
        &self,
        prompt: &str,
        files: &[FileSummary],
    ) -> Result<Candidate, CapabilityError>;

    async fn refine_code(
        &self,
        code: &str,
        outputs: &RunOutputs,
        history: &[String],
    ) -> Result<String, CapabilityError>;

    async fn refine_dependencies(
        &self,
        dependencies: &[String],
        code: &str,
        outputs: &RunOutputs,
        history: &[String],
    ) -> Result<Vec<String>, CapabilityError>;

    async fn improve_code(&self, code: &str, instructions: &str)
        -> Result<String, CapabilityError>;
}

#[async_trait]
pub trait ErrorClassifier: Send + Sync {
    async fn classify(&self, combined_output: &str) -> Result<Classification, CapabilityError>;
}

#[async_trait]
pub trait SolutionRanker: Send + Sync {
    /// Index into `candidates` of the best solution
    async fn rank(&self, candidates: &[RankingCandidate]) -> Result<usize, CapabilityError>;
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate_report(&self, prompt: &str, files: &FileMap)
        -> Result<String, CapabilityError>;
}

/// The full set of capabilities the engine consumes
#[derive(Clone)]
pub struct Capabilities {
    pub generator: Arc<dyn CodeGenerator>,
    pub classifier: Arc<dyn ErrorClassifier>,
    pub ranker: Arc<dyn SolutionRanker>,
    pub reporter: Arc<dyn ReportGenerator>,
}

impl Capabilities {
    /// One implementation serving every role
    pub fn from_single<T>(service: Arc<T>) -> Self
    where
        T: CodeGenerator + ErrorClassifier + SolutionRanker + ReportGenerator + 'static,
    {
        Self {
            generator: service.clone(),
            classifier: service.clone(),
            ranker: service.clone(),
            reporter: service,
        }
    }
}

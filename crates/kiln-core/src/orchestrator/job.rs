use crate::attempt::{Variant, VariantOutcome};
use crate::capabilities::{Classification, FileMap};
use crate::progress::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Payload of a completed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    pub best_variant: usize,
    pub code: String,
    pub dependencies: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub produced_files: FileMap,
    /// Inputs, the entry point and produced files together
    pub aggregate_files: FileMap,
    pub report: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub index: usize,
    pub succeeded: bool,
    pub attempts: u32,
    pub dependency_fixes: u32,
    pub code_fixes: u32,
    pub classification: Option<Classification>,
    pub message: Option<String>,
}

impl From<&Variant> for VariantSummary {
    fn from(variant: &Variant) -> Self {
        let (succeeded, classification, message) = match &variant.outcome {
            Some(VariantOutcome::Success(_)) => (true, Some(Classification::Ok), None),
            Some(VariantOutcome::Exhausted {
                classification,
                message,
            }) => (false, Some(*classification), Some(message.clone())),
            None => (false, None, None),
        };
        Self {
            index: variant.index,
            succeeded,
            attempts: variant.attempts,
            dependency_fixes: variant.dependency_fixes,
            code_fixes: variant.code_fixes,
            classification,
            message,
        }
    }
}

impl VariantSummary {
    pub fn describe(&self) -> String {
        if self.succeeded {
            format!(
                "Variant {}: succeeded after {} attempt(s)",
                self.index, self.attempts
            )
        } else {
            format!(
                "Variant {}: exhausted after {} attempt(s) ({})",
                self.index,
                self.attempts,
                self.message.as_deref().unwrap_or("no outcome")
            )
        }
    }
}

/// A submitted task and everything the orchestrator learned about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub prompt: String,
    pub input_files: FileMap,
    pub variants: Vec<Variant>,
    pub status: JobStatus,
    pub result: Option<FinalResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Job this one improves upon
    pub parent: Option<JobId>,
    pub instructions: Option<String>,
}

/// Point-in-time copy of a job
pub type JobSnapshot = Job;

impl Job {
    pub fn new(id: JobId, prompt: String, input_files: FileMap) -> Self {
        Self {
            id,
            prompt,
            input_files,
            variants: Vec::new(),
            status: JobStatus::Running,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
            parent: None,
            instructions: None,
        }
    }

    pub fn summaries(&self) -> Vec<VariantSummary> {
        self.variants.iter().map(VariantSummary::from).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.status != JobStatus::Running
    }
}

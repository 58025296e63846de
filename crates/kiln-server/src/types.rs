//! Request and response bodies. File contents travel as base64 strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use kiln_core::orchestrator::VariantSummary;
use kiln_core::{BackendHealth, FileMap, FinalResult, Job, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub prompt: String,
    /// File name to base64 content
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub task_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproveRequest {
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultView {
    pub best_variant: usize,
    pub code: String,
    pub dependencies: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Produced files, base64
    pub files: BTreeMap<String, String>,
    pub report: String,
}

impl From<&FinalResult> for ResultView {
    fn from(result: &FinalResult) -> Self {
        Self {
            best_variant: result.best_variant,
            code: result.code.clone(),
            dependencies: result.dependencies.clone(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            files: encode_files(&result.produced_files),
            report: result.report.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub prompt: String,
    pub parent: Option<JobId>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub variants: Vec<VariantSummary>,
    pub result: Option<ResultView>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            prompt: job.prompt.clone(),
            parent: job.parent,
            instructions: job.instructions.clone(),
            created_at: job.created_at,
            finished_at: job.finished_at,
            error: job.error.clone(),
            variants: job.summaries(),
            result: job.result.as_ref().map(ResultView::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` when the sandbox backend answers, else `degraded`
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub sandbox: Option<BackendHealth>,
    pub error: Option<String>,
}

pub fn decode_files(files: &BTreeMap<String, String>) -> Result<FileMap> {
    files
        .iter()
        .map(|(name, content)| {
            STANDARD
                .decode(content.trim())
                .map(|bytes| (name.clone(), bytes))
                .map_err(|e| {
                    ServerError::invalid_request(format!("file {} is not valid base64: {}", name, e))
                })
        })
        .collect()
}

pub fn encode_files(files: &FileMap) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|(name, bytes)| (name.clone(), STANDARD.encode(bytes)))
        .collect()
}

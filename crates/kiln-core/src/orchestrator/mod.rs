//! Job orchestration: fan out variants, pick the best success, report.
//!
//! `submit` returns as soon as the job is registered. The job then runs in
//! the background: N variant tasks each generate a candidate and drive it
//! through the attempt controller, successes are ranked, and the winner's
//! artifacts are handed to the report generator. The improvement flow
//! reuses the same machinery with a single, already-written variant.

use crate::attempt::{AttemptController, Variant};
use crate::capabilities::{Capabilities, Classification, FileMap, FileSummary, RankingCandidate};
use crate::environment::DependencySet;
use crate::errors::KilnError;
use crate::progress::{EventKind, JobId, ProgressChannel, ProgressReporter};
use crate::sandbox::SandboxSettings;
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod job;

pub use job::{FinalResult, Job, JobSnapshot, JobStatus, VariantSummary};

#[cfg(test)]
mod tests;

pub const STEP_GENERATE: &str = "Generate code";
pub const STEP_IMPROVE: &str = "Improve code";
pub const STEP_RANK: &str = "Rank solutions";
pub const STEP_REPORT: &str = "Generate report";

pub const NO_SUCCESS: &str = "no successful variant";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub variants: usize,
    /// Workspace layout, used to vet input names up front
    pub workspace: SandboxSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            variants: 3,
            workspace: SandboxSettings::default(),
        }
    }
}

enum JobPlan {
    Generate,
    Improve {
        code: String,
        dependencies: DependencySet,
        instructions: String,
    },
}

struct Inner {
    controller: AttemptController,
    capabilities: Capabilities,
    progress: Arc<ProgressChannel>,
    settings: OrchestratorSettings,
    jobs: RwLock<HashMap<JobId, Job>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        controller: AttemptController,
        capabilities: Capabilities,
        progress: Arc<ProgressChannel>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller,
                capabilities,
                progress,
                settings,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.inner.progress
    }

    /// Register a job and start it in the background. Input names that
    /// cannot be placed in the workspace are rejected before any work starts.
    pub async fn submit(&self, prompt: String, input_files: FileMap) -> Result<JobId, KilnError> {
        self.inner
            .settings
            .workspace
            .validate_inputs(&input_files)
            .map_err(|e| KilnError::InvalidInput(e.to_string()))?;

        let id = Uuid::new_v4();
        let job = Job::new(id, prompt, input_files);
        self.start(job, JobPlan::Generate).await;
        Ok(id)
    }

    /// Start a single-variant job from a completed job's winning solution
    pub async fn improve(&self, job_id: JobId, instructions: String) -> Result<JobId, KilnError> {
        let parent = self.status(job_id).await?;

        let result = match (&parent.status, &parent.result) {
            (JobStatus::Completed, Some(result)) => result.clone(),
            _ => {
                return Err(KilnError::InvalidJobState {
                    job_id: job_id.to_string(),
                    reason: format!("status is {:?}, expected Completed", parent.status),
                })
            }
        };

        let id = Uuid::new_v4();
        let mut job = Job::new(id, parent.prompt.clone(), parent.input_files.clone());
        job.parent = Some(job_id);
        job.instructions = Some(instructions.clone());

        let plan = JobPlan::Improve {
            code: result.code,
            dependencies: DependencySet::from_entries(result.dependencies),
            instructions,
        };
        self.start(job, plan).await;

        log::info!("Job {} improves job {}", id, job_id);
        Ok(id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobSnapshot, KilnError> {
        self.inner
            .jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))
    }

    /// All jobs, oldest first
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.inner.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    async fn start(&self, job: Job, plan: JobPlan) {
        let id = job.id;
        self.inner.progress.open(id);
        self.inner.jobs.write().await.insert(id, job);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(id, plan).await;
        });
    }

    async fn run_job(&self, id: JobId, plan: JobPlan) {
        let (prompt, input_files) = match self.status(id).await {
            Ok(job) => (job.prompt, Arc::new(job.input_files)),
            Err(e) => {
                log::error!("Job {} vanished before starting: {}", id, e);
                return;
            }
        };

        let variants = match plan {
            JobPlan::Generate => self.run_variants(id, &prompt, input_files.clone()).await,
            JobPlan::Improve {
                code,
                dependencies,
                instructions,
            } => {
                let variant = self
                    .run_improvement(id, code, dependencies, &instructions, &input_files)
                    .await;
                self.record_variant(id, variant.clone()).await;
                vec![variant]
            }
        };

        self.finish(id, &prompt, &input_files, variants).await;
    }

    async fn run_variants(&self, id: JobId, prompt: &str, input_files: Arc<FileMap>) -> Vec<Variant> {
        let count = self.inner.settings.variants;
        let summaries = Arc::new(FileSummary::summarize(&input_files));
        log::info!("Job {} starting {} variants", id, count);

        let handles: Vec<_> = (0..count)
            .map(|index| {
                let this = self.clone();
                let prompt = prompt.to_string();
                let summaries = summaries.clone();
                let input_files = input_files.clone();
                tokio::spawn(async move {
                    let variant = this
                        .run_variant(id, index, &prompt, &summaries, &input_files)
                        .await;
                    this.record_variant(id, variant.clone()).await;
                    variant
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| match joined {
                Ok(variant) => variant,
                Err(e) => {
                    log::error!("Variant {} of job {} aborted: {}", index, id, e);
                    Variant::exhausted(
                        index,
                        Classification::UnknownError,
                        format!("variant task failed: {}", e),
                    )
                }
            })
            .collect()
    }

    async fn run_variant(
        &self,
        id: JobId,
        index: usize,
        prompt: &str,
        summaries: &[FileSummary],
        input_files: &FileMap,
    ) -> Variant {
        let reporter = self.inner.progress.reporter(id, Some(index));
        reporter.step(STEP_GENERATE, "Generating candidate");

        let candidate = match self
            .inner
            .capabilities
            .generator
            .generate_candidate(prompt, summaries)
            .await
        {
            Ok(candidate) if !candidate.code.trim().is_empty() => candidate,
            Ok(_) => {
                reporter.error(STEP_GENERATE, "Generator returned empty code");
                return Variant::exhausted(
                    index,
                    Classification::UnknownError,
                    "generator returned empty code".to_string(),
                );
            }
            Err(e) => {
                log::warn!("Generation failed for variant {} of job {}: {}", index, id, e);
                reporter.error(STEP_GENERATE, &format!("Generation failed: {}", e));
                return Variant::exhausted(
                    index,
                    Classification::UnknownError,
                    format!("code generation failed: {}", e),
                );
            }
        };

        reporter.step(
            STEP_GENERATE,
            &format!(
                "Candidate ready ({} dependencies)",
                candidate.dependencies.len()
            ),
        );

        let variant = Variant::new(
            index,
            candidate.code,
            DependencySet::from_entries(candidate.dependencies),
        );
        self.inner
            .controller
            .drive(variant, input_files, &reporter)
            .await
    }

    async fn run_improvement(
        &self,
        id: JobId,
        code: String,
        dependencies: DependencySet,
        instructions: &str,
        input_files: &FileMap,
    ) -> Variant {
        let reporter: ProgressReporter = self.inner.progress.reporter(id, Some(0));
        reporter.step(STEP_IMPROVE, "Requesting improvement");

        let improved = match self
            .inner
            .capabilities
            .generator
            .improve_code(&code, instructions)
            .await
        {
            Ok(improved) if !improved.trim().is_empty() => improved,
            Ok(_) => {
                reporter.error(STEP_IMPROVE, "Generator returned empty code");
                return Variant::exhausted(
                    0,
                    Classification::UnknownError,
                    "improvement returned empty code".to_string(),
                );
            }
            Err(e) => {
                reporter.error(STEP_IMPROVE, &format!("Improvement failed: {}", e));
                return Variant::exhausted(
                    0,
                    Classification::UnknownError,
                    format!("code improvement failed: {}", e),
                );
            }
        };

        reporter.step(STEP_IMPROVE, "Improved code ready");
        self.inner
            .controller
            .drive(Variant::new(0, improved, dependencies), input_files, &reporter)
            .await
    }

    async fn record_variant(&self, id: JobId, variant: Variant) {
        let mut jobs = self.inner.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            match job.variants.iter_mut().find(|v| v.index == variant.index) {
                Some(existing) => *existing = variant,
                None => {
                    job.variants.push(variant);
                    job.variants.sort_by_key(|v| v.index);
                }
            }
        }
    }

    async fn finish(&self, id: JobId, prompt: &str, input_files: &FileMap, variants: Vec<Variant>) {
        let progress = &self.inner.progress;

        let summaries: Vec<VariantSummary> = variants.iter().map(VariantSummary::from).collect();
        let succeeded = summaries.iter().filter(|s| s.succeeded).count();
        let mut summary_text = format!("{}/{} variants succeeded", succeeded, summaries.len());
        for summary in &summaries {
            summary_text.push('\n');
            summary_text.push_str(&summary.describe());
        }
        progress.publish_summary(id, &summary_text);

        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.variants = variants.clone();
            }
        }

        let successes: Vec<&Variant> = variants.iter().filter(|v| v.success().is_some()).collect();
        if successes.is_empty() {
            self.fail(id, NO_SUCCESS.to_string()).await;
            return;
        }

        let candidates: Vec<RankingCandidate> = successes
            .iter()
            .filter_map(|variant| {
                variant.success().map(|run| RankingCandidate {
                    variant: variant.index,
                    code: variant.code.clone(),
                    dependencies: variant.dependencies.to_vec(),
                    outputs: run.outputs(),
                    produced_files: run.produced_files.clone(),
                })
            })
            .collect();

        progress.publish(
            id,
            None,
            STEP_RANK,
            &format!("Ranking {} solution(s)", candidates.len()),
            false,
        );
        let chosen = match self.inner.capabilities.ranker.rank(&candidates).await {
            Ok(choice) if choice < successes.len() => choice,
            Ok(choice) => {
                log::warn!(
                    "Ranker chose {} of {} candidates for job {}, using the first",
                    choice,
                    successes.len(),
                    id
                );
                0
            }
            Err(e) => {
                log::warn!("Ranking failed for job {}, using the first success: {}", id, e);
                0
            }
        };

        let best = successes[chosen];
        let Some(run) = best.success() else {
            self.fail(id, NO_SUCCESS.to_string()).await;
            return;
        };
        progress.publish(
            id,
            None,
            STEP_RANK,
            &format!("Selected variant {}", best.index),
            false,
        );

        let mut aggregate = input_files.clone();
        aggregate.insert(
            self.inner.settings.workspace.entry_point.clone(),
            best.code.as_bytes().to_vec(),
        );
        aggregate.extend(
            run.produced_files
                .iter()
                .map(|(name, bytes)| (name.clone(), bytes.clone())),
        );

        progress.publish(id, None, STEP_REPORT, "Writing report", false);
        let report = match self
            .inner
            .capabilities
            .reporter
            .generate_report(prompt, &aggregate)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                progress.publish(id, None, STEP_REPORT, &format!("Report failed: {}", e), true);
                self.fail(id, format!("report generation failed: {}", e)).await;
                return;
            }
        };
        progress.publish(id, None, STEP_REPORT, "Report ready", false);

        let result = FinalResult {
            best_variant: best.index,
            code: best.code.clone(),
            dependencies: best.dependencies.to_vec(),
            stdout: run.stdout.clone(),
            stderr: run.stderr.clone(),
            produced_files: run.produced_files.clone(),
            aggregate_files: aggregate,
            report,
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.finished_at = Some(Utc::now());
            }
        }

        log::info!("Job {} completed with variant {}", id, best.index);
        progress.publish_terminal(
            id,
            EventKind::Completed,
            &format!("Completed with variant {}", best.index),
        );
    }

    async fn fail(&self, id: JobId, error: String) {
        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Failed;
                job.error = Some(error.clone());
                job.finished_at = Some(Utc::now());
            }
        }

        log::warn!("Job {} failed: {}", id, error);
        self.inner
            .progress
            .publish_terminal(id, EventKind::Failed, &error);
    }
}

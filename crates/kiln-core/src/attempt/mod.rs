//! Bounded execute, classify and remediate loop for one variant.
//!
//! A variant runs until its code executes cleanly or the attempt budget is
//! spent. After each failed run at most one remediation happens: missing
//! modules reported by the interpreter are added to the dependency set
//! first, otherwise a code fix is requested when the failure looks like a
//! code problem and the code-fix budget remains.

use crate::capabilities::{Capabilities, Classification, FileMap};
use crate::config::RetryConfig;
use crate::environment::{DependencySet, EnvironmentCache};
use crate::progress::ProgressReporter;
use crate::sandbox::{RunResult, SandboxRunner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;


pub const STEP_RESOLVE: &str = "Resolve environment";
pub const STEP_EXECUTE: &str = "Execute in sandbox";
pub const STEP_ANALYZE: &str = "Analyze results";
pub const STEP_FIX_DEPENDENCIES: &str = "Fix dependencies";
pub const STEP_FIX_CODE: &str = "Fix code";

/// Loop bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_code_fixes: u32,
    pub history_window: usize,
    pub excerpt_chars: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_code_fixes: config.max_code_fixes,
            history_window: config.error_history_window,
            excerpt_chars: config.output_excerpt_chars,
        }
    }
}

/// The last execution of a variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub code: String,
    pub dependencies: Vec<String>,
    pub image: String,
    pub stdout: String,
    pub stderr: String,
    pub produced_files: Vec<String>,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariantOutcome {
    Success(RunResult),
    Exhausted {
        classification: Classification,
        message: String,
    },
}

/// One independent line of attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub index: usize,
    pub code: String,
    pub dependencies: DependencySet,
    pub attempts: u32,
    pub dependency_fixes: u32,
    pub code_fixes: u32,
    pub outcome: Option<VariantOutcome>,
    pub last_attempt: Option<Attempt>,
}

impl Variant {
    pub fn new(index: usize, code: String, dependencies: DependencySet) -> Self {
        Self {
            index,
            code,
            dependencies,
            attempts: 0,
            dependency_fixes: 0,
            code_fixes: 0,
            outcome: None,
            last_attempt: None,
        }
    }

    /// A variant that never ran, e.g. because generation failed
    pub fn exhausted(index: usize, classification: Classification, message: String) -> Self {
        let mut variant = Self::new(index, String::new(), DependencySet::new());
        variant.outcome = Some(VariantOutcome::Exhausted {
            classification,
            message,
        });
        variant
    }

    pub fn success(&self) -> Option<&RunResult> {
        match &self.outcome {
            Some(VariantOutcome::Success(run)) => Some(run),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Top-level module names from `ModuleNotFoundError` lines, in order of
/// first appearance
pub fn missing_modules(stderr: &str) -> Vec<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(pattern) = PATTERN
        .get_or_init(|| Regex::new(r"ModuleNotFoundError: No module named '([^']+)'").ok())
        .as_ref()
    else {
        return Vec::new();
    };

    let mut modules: Vec<String> = Vec::new();
    for captures in pattern.captures_iter(stderr) {
        let top_level = captures[1].split('.').next().unwrap_or_default().trim();
        if !top_level.is_empty() && !modules.iter().any(|m| m == top_level) {
            modules.push(top_level.to_string());
        }
    }
    modules
}

fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn failure_message(classification: Classification, run: &RunResult) -> String {
    let detail = run
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match run.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "no output".to_string(),
        });
    format!("{} error: {}", classification, detail)
}

/// Drives variants through the retry loop
#[derive(Clone)]
pub struct AttemptController {
    runner: SandboxRunner,
    cache: Arc<EnvironmentCache>,
    capabilities: Capabilities,
    policy: RetryPolicy,
    timeout: Duration,
}

impl AttemptController {
    pub fn new(
        runner: SandboxRunner,
        cache: Arc<EnvironmentCache>,
        capabilities: Capabilities,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            cache,
            capabilities,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `variant` from its current code and dependencies until terminal
    pub async fn drive(
        &self,
        mut variant: Variant,
        input_files: &FileMap,
        progress: &ProgressReporter,
    ) -> Variant {
        let max_attempts = self.policy.max_attempts;
        let mut history: VecDeque<String> = VecDeque::with_capacity(self.policy.history_window);
        let mut last_failure = (
            Classification::UnknownError,
            "no attempt was made".to_string(),
        );

        while variant.attempts < max_attempts {
            variant.attempts += 1;
            let number = variant.attempts;

            let environment = match self.cache.resolve(&variant.dependencies).await {
                Ok(environment) => {
                    progress.step(STEP_RESOLVE, &format!("Using {}", environment.image));
                    environment
                }
                Err(e) => {
                    log::warn!(
                        "Variant {} falling back to base environment: {}",
                        variant.index,
                        e
                    );
                    progress.error(STEP_RESOLVE, &format!("{}; using base environment", e));
                    self.cache.base()
                }
            };

            progress.step(
                STEP_EXECUTE,
                &format!("Attempt {}/{} running", number, max_attempts),
            );

            let run = match self
                .runner
                .run(&variant.code, input_files, &environment, self.timeout)
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    log::error!("Sandbox failure in variant {}: {}", variant.index, e);
                    progress.error(STEP_EXECUTE, &format!("Sandbox failure: {}", e));
                    variant.outcome = Some(VariantOutcome::Exhausted {
                        classification: Classification::InfrastructureError,
                        message: e.to_string(),
                    });
                    return variant;
                }
            };

            let classification = if run.timed_out {
                Classification::Timeout
            } else {
                let combined = format!("{}\n{}", run.stdout, run.stderr);
                match self.capabilities.classifier.classify(&combined).await {
                    Ok(classification) => classification,
                    Err(e) => {
                        log::warn!("Classifier failed for variant {}: {}", variant.index, e);
                        Classification::UnknownError
                    }
                }
            };

            variant.last_attempt = Some(Attempt {
                number,
                code: variant.code.clone(),
                dependencies: variant.dependencies.to_vec(),
                image: environment.image.clone(),
                stdout: run.stdout.clone(),
                stderr: run.stderr.clone(),
                produced_files: run.produced_files.keys().cloned().collect(),
                classification,
            });

            if classification == Classification::Ok {
                progress.step(STEP_ANALYZE, &format!("Attempt {} succeeded", number));
                log::info!(
                    "Variant {} succeeded after {} attempt(s)",
                    variant.index,
                    number
                );
                variant.outcome = Some(VariantOutcome::Success(run));
                return variant;
            }

            let message = failure_message(classification, &run);
            progress.error(STEP_ANALYZE, &format!("Attempt {}: {}", number, message));

            history.push_back(format!(
                "Attempt {}: {}\nOutput: {}\nError: {}",
                number,
                message,
                excerpt(&run.stdout, self.policy.excerpt_chars),
                excerpt(&run.stderr, self.policy.excerpt_chars)
            ));
            while history.len() > self.policy.history_window {
                history.pop_front();
            }
            last_failure = (classification, message);

            // Nothing left to remediate for
            if variant.attempts >= max_attempts {
                break;
            }

            let recent: Vec<String> = history.iter().cloned().collect();
            let missing = missing_modules(&run.stderr);

            if !missing.is_empty() {
                self.fix_dependencies(&mut variant, &missing, &run, &recent, progress)
                    .await;
            } else if classification.wants_code_fix()
                && variant.code_fixes < self.policy.max_code_fixes
            {
                self.fix_code(&mut variant, &run, &recent, progress).await;
            } else {
                log::debug!(
                    "No remediation for variant {} after {} ({})",
                    variant.index,
                    classification,
                    if classification.wants_code_fix() {
                        "code-fix budget spent"
                    } else {
                        "not code related"
                    }
                );
            }
        }

        let (classification, message) = last_failure;
        log::info!(
            "Variant {} exhausted after {} attempt(s): {}",
            variant.index,
            variant.attempts,
            message
        );
        variant.outcome = Some(VariantOutcome::Exhausted {
            classification,
            message,
        });
        variant
    }

    async fn fix_dependencies(
        &self,
        variant: &mut Variant,
        missing: &[String],
        run: &RunResult,
        history: &[String],
        progress: &ProgressReporter,
    ) {
        variant.dependency_fixes += 1;

        let mut next = variant.dependencies.clone();
        for module in missing {
            next.insert(module);
        }
        progress.step(
            STEP_FIX_DEPENDENCIES,
            &format!("Missing modules: {}", missing.join(", ")),
        );

        match self
            .capabilities
            .generator
            .refine_dependencies(&next.to_vec(), &variant.code, &run.outputs(), history)
            .await
        {
            Ok(answer) => {
                next.merge(&DependencySet::from_entries(answer));
            }
            Err(e) => {
                log::warn!(
                    "Dependency refiner failed for variant {}: {}",
                    variant.index,
                    e
                );
                progress.error(STEP_FIX_DEPENDENCIES, &format!("Refiner failed: {}", e));
            }
        }

        if next != variant.dependencies {
            progress.step(
                STEP_FIX_DEPENDENCIES,
                &format!("Dependencies: {}", next.to_vec().join(", ")),
            );
        }
        variant.dependencies = next;
    }

    async fn fix_code(
        &self,
        variant: &mut Variant,
        run: &RunResult,
        history: &[String],
        progress: &ProgressReporter,
    ) {
        variant.code_fixes += 1;
        progress.step(
            STEP_FIX_CODE,
            &format!(
                "Requesting fix {}/{}",
                variant.code_fixes, self.policy.max_code_fixes
            ),
        );

        match self
            .capabilities
            .generator
            .refine_code(&variant.code, &run.outputs(), history)
            .await
        {
            Ok(code) if !code.trim().is_empty() => {
                variant.code = code;
                progress.step(STEP_FIX_CODE, "Code updated");
            }
            Ok(_) => {
                log::warn!("Code refiner returned empty code for variant {}", variant.index);
                progress.error(STEP_FIX_CODE, "Refiner returned empty code");
            }
            Err(e) => {
                log::warn!("Code refiner failed for variant {}: {}", variant.index, e);
                progress.error(STEP_FIX_CODE, &format!("Refiner failed: {}", e));
            }
        }
    }
}

//! Mock reasoning capabilities for testing

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::capabilities::{
    Candidate, Capabilities, Classification, CodeGenerator, ErrorClassifier, FileMap, FileSummary,
    RankingCandidate, ReportGenerator, RunOutputs, SolutionRanker,
};
use crate::errors::CapabilityError;

#[derive(Debug, Clone, Default)]
pub struct GeneratorCalls {
    pub generate: usize,
    pub refine_code: usize,
    pub refine_dependencies: usize,
    pub improve: usize,
    pub histories: Vec<Vec<String>>,
    pub file_summaries: Vec<Vec<FileSummary>>,
}

/// Generator returning queued candidates, then the default one
pub struct MockGenerator {
    candidates: Mutex<VecDeque<Result<Candidate, CapabilityError>>>,
    default_candidate: Candidate,
    code_fix: Mutex<Result<String, CapabilityError>>,
    dependency_fix: Mutex<Result<Vec<String>, CapabilityError>>,
    improved: Mutex<Result<String, CapabilityError>>,
    calls: Arc<Mutex<GeneratorCalls>>,
}

impl MockGenerator {
    pub fn new(code: &str) -> Self {
        Self {
            candidates: Mutex::new(VecDeque::new()),
            default_candidate: Candidate {
                code: code.to_string(),
                dependencies: vec![],
            },
            code_fix: Mutex::new(Ok(code.to_string())),
            dependency_fix: Mutex::new(Ok(vec![])),
            improved: Mutex::new(Ok(code.to_string())),
            calls: Arc::new(Mutex::new(GeneratorCalls::default())),
        }
    }

    pub fn with_candidates(self, candidates: Vec<Result<Candidate, CapabilityError>>) -> Self {
        *self.candidates.lock().unwrap() = candidates.into();
        self
    }

    pub fn with_code_fix(self, fix: Result<String, CapabilityError>) -> Self {
        *self.code_fix.lock().unwrap() = fix;
        self
    }

    pub fn with_dependency_fix(self, fix: Result<Vec<String>, CapabilityError>) -> Self {
        *self.dependency_fix.lock().unwrap() = fix;
        self
    }

    pub fn with_improvement(self, improved: Result<String, CapabilityError>) -> Self {
        *self.improved.lock().unwrap() = improved;
        self
    }

    pub fn calls(&self) -> GeneratorCalls {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for MockGenerator {
    async fn generate_candidate(
        &self,
        _prompt: &str,
        files: &[FileSummary],
    ) -> Result<Candidate, CapabilityError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.generate += 1;
            calls.file_summaries.push(files.to_vec());
        }
        match self.candidates.lock().unwrap().pop_front() {
            Some(candidate) => candidate,
            None => Ok(self.default_candidate.clone()),
        }
    }

    async fn refine_code(
        &self,
        _code: &str,
        _outputs: &RunOutputs,
        history: &[String],
    ) -> Result<String, CapabilityError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.refine_code += 1;
            calls.histories.push(history.to_vec());
        }
        self.code_fix.lock().unwrap().clone()
    }

    async fn refine_dependencies(
        &self,
        _dependencies: &[String],
        _code: &str,
        _outputs: &RunOutputs,
        history: &[String],
    ) -> Result<Vec<String>, CapabilityError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.refine_dependencies += 1;
            calls.histories.push(history.to_vec());
        }
        self.dependency_fix.lock().unwrap().clone()
    }

    async fn improve_code(&self, _code: &str, _instructions: &str) -> Result<String, CapabilityError> {
        self.calls.lock().unwrap().improve += 1;
        self.improved.lock().unwrap().clone()
    }
}

/// Classifier reading Python error markers from the combined output
pub struct MockClassifier {
    fixed: Option<Result<Classification, CapabilityError>>,
    calls: Mutex<usize>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            fixed: None,
            calls: Mutex::new(0),
        }
    }

    pub fn fixed(result: Result<Classification, CapabilityError>) -> Self {
        Self {
            fixed: Some(result),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ErrorClassifier for MockClassifier {
    async fn classify(&self, combined_output: &str) -> Result<Classification, CapabilityError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(fixed) = &self.fixed {
            return fixed.clone();
        }
        if combined_output.contains("ModuleNotFoundError") {
            Ok(Classification::DependencyError)
        } else if combined_output.contains("Traceback") || combined_output.contains("Error:") {
            Ok(Classification::CodeError)
        } else {
            Ok(Classification::Ok)
        }
    }
}

pub struct MockRanker {
    result: Result<usize, CapabilityError>,
    calls: Mutex<Vec<Vec<RankingCandidate>>>,
}

impl MockRanker {
    pub fn new(result: Result<usize, CapabilityError>) -> Self {
        Self {
            result,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Variant indices of each ranking call
    pub fn seen(&self) -> Vec<Vec<usize>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.iter().map(|c| c.variant).collect())
            .collect()
    }

    /// Full candidates of each ranking call
    pub fn candidates(&self) -> Vec<Vec<RankingCandidate>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SolutionRanker for MockRanker {
    async fn rank(&self, candidates: &[RankingCandidate]) -> Result<usize, CapabilityError> {
        self.calls.lock().unwrap().push(candidates.to_vec());
        self.result.clone()
    }
}

pub struct MockReporter {
    result: Result<String, CapabilityError>,
    seen: Mutex<Vec<Vec<String>>>,
}

impl MockReporter {
    pub fn new(result: Result<String, CapabilityError>) -> Self {
        Self {
            result,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// File names handed to each report call
    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportGenerator for MockReporter {
    async fn generate_report(&self, _prompt: &str, files: &FileMap) -> Result<String, CapabilityError> {
        self.seen
            .lock()
            .unwrap()
            .push(files.keys().cloned().collect());
        self.result.clone()
    }
}

/// Handles to every mock behind a `Capabilities` bundle
pub struct MockCapabilities {
    pub generator: Arc<MockGenerator>,
    pub classifier: Arc<MockClassifier>,
    pub ranker: Arc<MockRanker>,
    pub reporter: Arc<MockReporter>,
}

impl MockCapabilities {
    pub fn new(generator: MockGenerator) -> Self {
        Self {
            generator: Arc::new(generator),
            classifier: Arc::new(MockClassifier::new()),
            ranker: Arc::new(MockRanker::new(Ok(0))),
            reporter: Arc::new(MockReporter::new(Ok("# Report".to_string()))),
        }
    }

    pub fn with_classifier(mut self, classifier: MockClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_ranker(mut self, ranker: MockRanker) -> Self {
        self.ranker = Arc::new(ranker);
        self
    }

    pub fn with_reporter(mut self, reporter: MockReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn bundle(&self) -> Capabilities {
        Capabilities {
            generator: self.generator.clone(),
            classifier: self.classifier.clone(),
            ranker: self.ranker.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

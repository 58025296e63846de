//! Google Gemini backed implementation of the reasoning capabilities.
//!
//! Every capability is a single `generateContent` call with a purpose-built
//! prompt; answers are plain text and are cleaned up here before they reach
//! the engine.

use crate::capabilities::{
    Candidate, Classification, CodeGenerator, ErrorClassifier, FileMap, FileSummary,
    RankingCandidate, ReportGenerator, RunOutputs, SolutionRanker,
};
use crate::config::loader::ConfigLoader;
use crate::config::AssistantConfig;
use crate::errors::CapabilityError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub mod prompts;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetails {
    code: u16,
    message: String,
}

pub struct GeminiAssistant {
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: u32,
    client: Client,
}

impl GeminiAssistant {
    /// Build the client; the API key comes from the config or its env var
    pub fn new(config: &AssistantConfig) -> Result<Self, CapabilityError> {
        let api_key = ConfigLoader::resolve_api_key(config).ok_or_else(|| {
            CapabilityError::MissingApiKey(format!(
                "set {} or assistant.api_key",
                config.api_key_env
            ))
        })?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            client: Client::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one prompt and return the concatenated text of the first candidate
    async fn complete(&self, prompt: String) -> Result<String, CapabilityError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(service_error(status, &error_text));
        }

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Parse(format!("invalid Gemini response: {}", e)))?;

        let text = body
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(CapabilityError::EmptyAnswer);
        }
        log::debug!("Gemini answered with {} bytes", text.len());
        Ok(text)
    }

    async fn complete_code(&self, prompt: String) -> Result<String, CapabilityError> {
        let code = strip_code_fences(&self.complete(prompt).await?);
        if code.is_empty() {
            return Err(CapabilityError::EmptyAnswer);
        }
        Ok(code)
    }

    async fn complete_requirements(&self, prompt: String) -> Result<Vec<String>, CapabilityError> {
        match self.complete(prompt).await {
            Ok(answer) => Ok(parse_requirements(&answer)),
            // An empty list is a legitimate answer here
            Err(CapabilityError::EmptyAnswer) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn service_error(status: u16, body: &str) -> CapabilityError {
    match serde_json::from_str::<GeminiError>(body) {
        Ok(parsed) => CapabilityError::Service {
            status: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => CapabilityError::Service {
            status,
            message: body.to_string(),
        },
    }
}

/// Remove a surrounding Markdown code fence, if any
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.first().is_some_and(|l| l.starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Requirement lines of an answer, without fences or comments
pub fn parse_requirements(answer: &str) -> Vec<String> {
    answer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("```"))
        .map(|line| line.trim_matches('`').trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Map a one-word verdict to a classification
pub fn parse_classification(answer: &str) -> Classification {
    let verdict = answer
        .split_whitespace()
        .next()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_alphabetic())
                .to_ascii_uppercase()
        })
        .unwrap_or_default();

    match verdict.as_str() {
        "OK" => Classification::Ok,
        "DEPENDENCY" => Classification::DependencyError,
        "CODE" => Classification::CodeError,
        "BOTH" => Classification::BothError,
        _ => Classification::UnknownError,
    }
}

/// Preferred index from `{"best": n}`, `[n, ...]`, or the first integer
pub fn parse_rank(answer: &str) -> Result<usize, CapabilityError> {
    let cleaned = strip_code_fences(answer);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        let index = match &value {
            serde_json::Value::Object(map) => map.get("best").and_then(|v| v.as_u64()),
            serde_json::Value::Array(items) => items.first().and_then(|v| v.as_u64()),
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        };
        if let Some(index) = index {
            return Ok(index as usize);
        }
    }

    let digits: String = answer
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse()
        .map_err(|_| CapabilityError::Parse(format!("no solution index in {:?}", answer.trim())))
}

#[async_trait]
impl CodeGenerator for GeminiAssistant {
    async fn generate_candidate(
        &self,
        prompt: &str,
        files: &[FileSummary],
    ) -> Result<Candidate, CapabilityError> {
        let code = self.complete_code(prompts::generate(prompt, files)).await?;
        let dependencies = self
            .complete_requirements(prompts::dependencies(&code))
            .await?;
        Ok(Candidate { code, dependencies })
    }

    async fn refine_code(
        &self,
        code: &str,
        outputs: &RunOutputs,
        history: &[String],
    ) -> Result<String, CapabilityError> {
        self.complete_code(prompts::refine_code(code, outputs, history))
            .await
    }

    async fn refine_dependencies(
        &self,
        dependencies: &[String],
        code: &str,
        outputs: &RunOutputs,
        history: &[String],
    ) -> Result<Vec<String>, CapabilityError> {
        self.complete_requirements(prompts::refine_dependencies(
            dependencies,
            code,
            outputs,
            history,
        ))
        .await
    }

    async fn improve_code(&self, code: &str, instructions: &str) -> Result<String, CapabilityError> {
        self.complete_code(prompts::improve(code, instructions)).await
    }
}

#[async_trait]
impl ErrorClassifier for GeminiAssistant {
    async fn classify(&self, combined_output: &str) -> Result<Classification, CapabilityError> {
        let answer = self.complete(prompts::classify(combined_output)).await?;
        Ok(parse_classification(&answer))
    }
}

#[async_trait]
impl SolutionRanker for GeminiAssistant {
    async fn rank(&self, candidates: &[RankingCandidate]) -> Result<usize, CapabilityError> {
        if candidates.len() <= 1 {
            return Ok(0);
        }
        let answer = self.complete(prompts::rank(candidates)).await?;
        parse_rank(&answer)
    }
}

#[async_trait]
impl ReportGenerator for GeminiAssistant {
    async fn generate_report(&self, prompt: &str, files: &FileMap) -> Result<String, CapabilityError> {
        let summaries = FileSummary::summarize(files);
        let report = self.complete(prompts::report(prompt, &summaries)).await?;
        Ok(strip_markdown_wrapper(&report))
    }
}

/// Reports sometimes arrive wrapped in a ```markdown fence
fn strip_markdown_wrapper(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```markdown") || trimmed.starts_with("```md") {
        strip_code_fences(trimmed)
    } else {
        trimmed.to_string()
    }
}

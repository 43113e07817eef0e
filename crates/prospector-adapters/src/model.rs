//! Structured-output model inference over the Gemini `generateContent` API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use prospector_core::truncate_for_log;
use prospector_storage::{classify_reqwest_error, Classify, RetryDisposition};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const MODEL_TIMEOUT: Duration = Duration::from_secs(120);

/// The structured shapes the workflow asks the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSchema {
    JobScores,
    CoverLetter,
    CallScript,
    Answers,
}

impl OutputSchema {
    pub fn name(&self) -> &'static str {
        match self {
            OutputSchema::JobScores => "job_scores",
            OutputSchema::CoverLetter => "cover_letter",
            OutputSchema::CallScript => "call_script",
            OutputSchema::Answers => "answers",
        }
    }

    /// Response schema in the dialect `generateContent` accepts.
    pub fn json_schema(&self) -> JsonValue {
        match self {
            OutputSchema::JobScores => json!({
                "type": "OBJECT",
                "properties": {
                    "matches": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "properties": {
                                "job_id": { "type": "STRING" },
                                "score": { "type": "INTEGER" }
                            },
                            "required": ["job_id", "score"]
                        }
                    }
                },
                "required": ["matches"]
            }),
            OutputSchema::CoverLetter => json!({
                "type": "OBJECT",
                "properties": { "letter": { "type": "STRING" } },
                "required": ["letter"]
            }),
            OutputSchema::CallScript => json!({
                "type": "OBJECT",
                "properties": { "script": { "type": "STRING" } },
                "required": ["script"]
            }),
            OutputSchema::Answers => json!({
                "type": "OBJECT",
                "properties": {
                    "answers": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "properties": { "answer": { "type": "STRING" } },
                            "required": ["answer"]
                        }
                    }
                },
                "required": ["answers"]
            }),
        }
    }

    /// Structural check of a decoded response. Individual score entries are
    /// validated later by the scorer, which drops bad ones instead of failing.
    pub fn validate(&self, value: &JsonValue) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("{} output is not a JSON object", self.name()))?;
        match self {
            OutputSchema::JobScores => match object.get("matches") {
                Some(JsonValue::Array(_)) => Ok(()),
                _ => Err("`matches` must be an array".to_string()),
            },
            OutputSchema::CoverLetter => require_string(object, "letter"),
            OutputSchema::CallScript => require_string(object, "script"),
            OutputSchema::Answers => {
                let answers = object
                    .get("answers")
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| "`answers` must be an array".to_string())?;
                if answers
                    .iter()
                    .all(|a| a.get("answer").map(JsonValue::is_string).unwrap_or(false))
                {
                    Ok(())
                } else {
                    Err("every answer needs a string `answer`".to_string())
                }
            }
        }
    }
}

fn require_string(object: &serde_json::Map<String, JsonValue>, key: &str) -> Result<(), String> {
    match object.get(key) {
        Some(JsonValue::String(_)) => Ok(()),
        _ => Err(format!("`{key}` must be a string")),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverLetterOutput {
    pub letter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallScriptOutput {
    pub script: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerOutput {
    pub answer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswersOutput {
    #[serde(default)]
    pub answers: Vec<AnswerOutput>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model rate limited (status {status}): {body}")]
    RateLimited { status: u16, body: String },
    #[error("model server error (status {status}): {body}")]
    Server { status: u16, body: String },
    #[error("model transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed model output for {schema}: {reason}")]
    Malformed { schema: &'static str, reason: String },
    #[error("model rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("model client misconfigured: {0}")]
    Config(String),
}

impl Classify for ModelError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ModelError::RateLimited { .. }
            | ModelError::Server { .. }
            | ModelError::Malformed { .. } => RetryDisposition::Retryable,
            ModelError::Transport(err) => classify_reqwest_error(err),
            ModelError::Rejected { .. } | ModelError::Config(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Runs one prompt and returns output already validated against `schema`.
    async fn infer(&self, prompt: &str, schema: OutputSchema) -> Result<JsonValue, ModelError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Thin `generateContent` client. Retries and circuit breaking are applied
/// by the caller through the resilient executor.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            anyhow::bail!("GEMINI_API_KEY is empty");
        }
        let client = reqwest::Client::builder()
            .timeout(MODEL_TIMEOUT)
            .build()
            .context("building model http client")?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            api_base: GEMINI_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn infer(&self, prompt: &str, schema: OutputSchema) -> Result<JsonValue, ModelError> {
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                response_schema: schema.json_schema(),
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncate_for_log(&response.text().await.unwrap_or_default());
            return Err(status_error(status, body));
        }

        let decoded: GenerateContentResponse = response.json().await?;
        if let Some(usage) = &decoded.usage_metadata {
            debug!(
                model = %self.model,
                schema = schema.name(),
                input_tokens = usage.prompt_token_count,
                output_tokens = usage.candidates_token_count,
                "model call completed"
            );
        }
        let text = candidate_text(&decoded).ok_or_else(|| ModelError::Malformed {
            schema: schema.name(),
            reason: "response has no candidate text".to_string(),
        })?;
        parse_structured_output(&text, schema)
    }
}

fn status_error(status: StatusCode, body: String) -> ModelError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ModelError::RateLimited { status: code, body }
    } else if status.is_server_error() {
        ModelError::Server { status: code, body }
    } else {
        ModelError::Rejected { status: code, body }
    }
}

fn candidate_text(response: &GenerateContentResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Decodes model text as JSON, unwrapping a top-level array to its first
/// element, and checks it against `schema`.
pub fn parse_structured_output(text: &str, schema: OutputSchema) -> Result<JsonValue, ModelError> {
    let mut value: JsonValue =
        serde_json::from_str(text.trim()).map_err(|e| ModelError::Malformed {
            schema: schema.name(),
            reason: format!("not JSON ({e}): {}", truncate_for_log(text)),
        })?;

    if let JsonValue::Array(items) = &mut value {
        if items.is_empty() {
            return Err(ModelError::Malformed {
                schema: schema.name(),
                reason: "empty JSON array".to_string(),
            });
        }
        value = items.swap_remove(0);
    }

    schema.validate(&value).map_err(|reason| ModelError::Malformed {
        schema: schema.name(),
        reason,
    })?;
    Ok(value)
}

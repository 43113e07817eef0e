use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prospector_core::{ApplicationArtifacts, JobRecord, JobType, QuestionAnswer};
use prospector_storage::{classify_reqwest_error, Classify, RetryDisposition};
use serde::Serialize;
use thiserror::Error;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookJobDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub job_type: Option<JobType>,
    pub experience_level: String,
    pub duration: String,
    pub rate: Option<String>,
    pub client_information: Option<String>,
    pub score: f64,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookGeneratedContent {
    pub cover_letter: String,
    pub interview_script: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<QuestionAnswer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookMetadata {
    pub processed_at: DateTime<Utc>,
    pub search_query: String,
    pub match_score: f64,
}

/// Body posted downstream for every high-value job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub timestamp: DateTime<Utc>,
    pub job_details: WebhookJobDetails,
    pub generated_content: WebhookGeneratedContent,
    pub metadata: WebhookMetadata,
}

impl WebhookPayload {
    pub fn new(
        job_id: &str,
        job: &JobRecord,
        artifacts: &ApplicationArtifacts,
        search_query: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let score = job.score_or_zero();
        Self {
            timestamp,
            job_details: WebhookJobDetails {
                id: job_id.to_string(),
                title: job.title.clone(),
                description: job.description.clone(),
                job_type: job.job_type,
                experience_level: job.experience_level.clone(),
                duration: job.duration.clone(),
                rate: job.rate.clone(),
                client_information: job.client_information.clone(),
                score,
                url: job.apply_url.clone(),
            },
            generated_content: WebhookGeneratedContent {
                cover_letter: artifacts.cover_letter.clone(),
                interview_script: artifacts.interview_script.clone(),
                answers: artifacts.answers.clone(),
            },
            metadata: WebhookMetadata {
                processed_at: artifacts.generated_at,
                search_query: search_query.to_string(),
                match_score: score,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook returned status {status}")]
    Status { status: u16 },
    #[error("webhook transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Classify for WebhookError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            // Any non-2xx counts against the endpoint's circuit.
            WebhookError::Status { .. } => RetryDisposition::Retryable,
            WebhookError::Transport(err) => classify_reqwest_error(err),
        }
    }
}

#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<(), WebhookError>;
}

#[derive(Debug, Clone)]
pub struct HttpWebhookSink {
    client: reqwest::Client,
    url: String,
}

impl HttpWebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("building webhook http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WebhookSink for HttpWebhookSink {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_expected_sections() {
        let mut job = JobRecord::new("Rust dev", "Build a crawler");
        job.score = Some(8.0);
        job.apply_url = Some("https://example.test/apply/1".into());
        let at = DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let artifacts = ApplicationArtifacts {
            job_id: "1".into(),
            cover_letter: "Hello, I can help.".into(),
            interview_script: "# Introduction".into(),
            answers: vec![],
            generated_at: at,
        };

        let payload = WebhookPayload::new("1", &job, &artifacts, "rust developer", at);
        let value = serde_json::to_value(&payload).expect("json");
        assert_eq!(value["job_details"]["id"], "1");
        assert_eq!(value["job_details"]["url"], "https://example.test/apply/1");
        assert_eq!(value["generated_content"]["cover_letter"], "Hello, I can help.");
        assert!(value["generated_content"].get("answers").is_none());
        assert_eq!(value["metadata"]["search_query"], "rust developer");
        assert_eq!(value["metadata"]["match_score"], 8.0);
    }

    #[test]
    fn non_success_status_is_retryable() {
        let err = WebhookError::Status { status: 404 };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }
}

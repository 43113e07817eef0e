//! Core domain model for the job prospector: scraped listings, matches, and
//! the generated application artifacts that flow through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prospector-core";

/// Minimum fit score for a listing to enter the match worklist.
pub const MATCH_THRESHOLD: f64 = 7.0;

/// Default score at or above which a match gets question answers and a webhook.
pub const DEFAULT_HIGH_VALUE_THRESHOLD: f64 = 7.0;

/// Listings are sent to the model in batches of this size when scoring.
pub const SCORING_BATCH_SIZE: usize = 5;

/// Every cover letter must open with this salutation.
pub const COVER_LETTER_SALUTATION: &str = "Hello";

const LOG_TRUNCATE_AT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Fixed,
    Hourly,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Fixed => "Fixed",
            JobType::Hourly => "Hourly",
        }
    }
}

/// One normalized listing scraped from the job board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable platform identifier. Filled with a content-derived id when the
    /// platform did not expose one.
    #[serde(default)]
    pub job_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub experience_level: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub rate: Option<String>,
    #[serde(default, alias = "client_infomation")]
    pub client_information: Option<String>,
    #[serde(default, alias = "url")]
    pub apply_url: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl JobRecord {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            job_id: None,
            title: title.into(),
            description: description.into(),
            job_type: None,
            experience_level: String::new(),
            duration: String::new(),
            rate: None,
            client_information: None,
            apply_url: None,
            score: None,
        }
    }

    /// The platform id, if one was scraped and is non-blank.
    pub fn stable_id(&self) -> Option<&str> {
        self.job_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Whether there is anything to derive a content identity from.
    pub fn has_content(&self) -> bool {
        !self.description.trim().is_empty() || self.apply_url.is_some()
    }

    /// SHA-256 over the description and apply URL. Including the URL keeps two
    /// listings with identical boilerplate text apart.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.description.trim().as_bytes());
        if let Some(url) = self.apply_url.as_deref() {
            hasher.update(b"\n");
            hasher.update(url.trim().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Identity used when no stable id exists: a short content hash, or a
    /// fresh UUID when there is nothing to hash.
    pub fn fallback_id(&self) -> String {
        if !self.has_content() {
            return format!("job-{}", Uuid::new_v4());
        }
        content_id(&self.content_hash())
    }

    /// Stable id when present, otherwise the content-derived fallback.
    pub fn identity(&self) -> String {
        self.stable_id()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.fallback_id())
    }

    pub fn score_or_zero(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }

    pub fn is_match(&self, threshold: f64) -> bool {
        self.score_or_zero() >= threshold
    }
}

/// Short id derived from a full content hash.
pub fn content_id(content_hash: &str) -> String {
    let prefix: String = content_hash.chars().take(16).collect();
    format!("sha-{prefix}")
}

/// Projection of a matched record used as model input for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedJob {
    pub job_id: String,
    pub title: String,
    pub description: String,
    pub apply_url: Option<String>,
    pub score: f64,
}

impl MatchedJob {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.identity(),
            title: record.title.clone(),
            description: record.description.clone(),
            apply_url: record.apply_url.clone(),
            score: record.score_or_zero(),
        }
    }

    /// Title + description block handed to the generation prompts.
    pub fn prompt_text(&self) -> String {
        format!("Title: {}\nDescription:\n{}\n", self.title, self.description)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Text,
    MultipleChoice,
    YesNo,
}

/// Extra question scraped from a listing's application page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationQuestion {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl ApplicationQuestion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: QuestionKind::Text,
            options: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub question: String,
    pub answer: String,
}

/// Pairs answers with their questions by position; surplus entries on either
/// side are dropped.
pub fn pair_answers(questions: &[ApplicationQuestion], answers: Vec<String>) -> Vec<QuestionAnswer> {
    questions
        .iter()
        .zip(answers)
        .map(|(q, answer)| QuestionAnswer {
            question: q.text.clone(),
            answer,
        })
        .collect()
}

/// Everything generated for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationArtifacts {
    pub job_id: String,
    pub cover_letter: String,
    pub interview_script: String,
    #[serde(default)]
    pub answers: Vec<QuestionAnswer>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Generated,
    BelowThreshold,
}

/// Result stored in the processed ledger once a job is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub job_id: String,
    pub status: ProcessingStatus,
    pub score: f64,
    #[serde(default)]
    pub cover_letter: Option<String>,
    #[serde(default)]
    pub interview_script: Option<String>,
    #[serde(default)]
    pub answers: Vec<QuestionAnswer>,
    #[serde(default)]
    pub webhook_delivered: bool,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn generated(artifacts: &ApplicationArtifacts, score: f64, webhook_delivered: bool) -> Self {
        Self {
            job_id: artifacts.job_id.clone(),
            status: ProcessingStatus::Generated,
            score,
            cover_letter: Some(artifacts.cover_letter.clone()),
            interview_script: Some(artifacts.interview_script.clone()),
            answers: artifacts.answers.clone(),
            webhook_delivered,
            processed_at: artifacts.generated_at,
        }
    }

    pub fn below_threshold(job_id: impl Into<String>, score: f64, processed_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: ProcessingStatus::BelowThreshold,
            score,
            cover_letter: None,
            interview_script: None,
            answers: Vec::new(),
            webhook_delivered: false,
            processed_at,
        }
    }
}

/// Ensures the letter opens with the fixed salutation.
pub fn ensure_salutation(letter: &str) -> String {
    let letter = letter.trim_start();
    if letter.starts_with(COVER_LETTER_SALUTATION) {
        letter.to_string()
    } else {
        format!("{COVER_LETTER_SALUTATION}, {letter}")
    }
}

/// Caps long error bodies and model output before they reach the logs.
pub fn truncate_for_log(content: &str) -> String {
    if content.chars().count() <= LOG_TRUNCATE_AT {
        return content.to_string();
    }
    let head: String = content.chars().take(LOG_TRUNCATE_AT).collect();
    format!("{head}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_stable_id() {
        let mut record = JobRecord::new("Rust dev", "Build a crawler");
        record.job_id = Some(" 0123 ".into());
        assert_eq!(record.identity(), "0123");
    }

    #[test]
    fn identity_falls_back_to_content_hash() {
        let a = JobRecord::new("Rust dev", "Build a crawler");
        let b = JobRecord::new("Another title", "Build a crawler");
        assert_eq!(a.identity(), b.identity());
        assert!(a.identity().starts_with("sha-"));

        let mut c = b.clone();
        c.apply_url = Some("https://example.test/jobs/2".into());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn empty_listing_gets_fresh_identity() {
        let a = JobRecord::new("", "  ");
        assert_ne!(a.identity(), a.identity());
    }

    #[test]
    fn salutation_is_prepended_once() {
        assert_eq!(ensure_salutation("I can help."), "Hello, I can help.");
        assert_eq!(ensure_salutation("Hello Sam, I can help."), "Hello Sam, I can help.");
    }

    #[test]
    fn answers_pair_positionally() {
        let questions = vec![
            ApplicationQuestion::text("Rate?"),
            ApplicationQuestion::text("Start date?"),
        ];
        let pairs = pair_answers(&questions, vec!["$60/hr".into()]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].question, "Rate?");
        assert_eq!(pairs[0].answer, "$60/hr");
    }

    #[test]
    fn record_accepts_legacy_field_names() {
        let record: JobRecord = serde_json::from_value(serde_json::json!({
            "job_id": "42",
            "title": "ML Engineer",
            "description": "Train models",
            "job_type": "Hourly",
            "client_infomation": "US | 12 hires",
            "url": "https://example.test/apply/42"
        }))
        .expect("record");
        assert_eq!(record.job_type, Some(JobType::Hourly));
        assert_eq!(record.client_information.as_deref(), Some("US | 12 hires"));
        assert_eq!(record.apply_url.as_deref(), Some("https://example.test/apply/42"));
        assert_eq!(record.score, None);
    }

    #[test]
    fn long_log_content_is_truncated() {
        let long = "x".repeat(600);
        let out = truncate_for_log(&long);
        assert!(out.ends_with("... [truncated]"));
        assert_eq!(out.len(), 500 + "... [truncated]".len());
    }
}

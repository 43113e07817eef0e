//! External collaborators of the workflow: listing scrapers, the apply-page
//! question scraper, the generative model client and the webhook sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use prospector_core::JobRecord;
use prospector_storage::{classify_reqwest_error, classify_status, Classify, RetryDisposition};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub mod model;
pub mod prompts;
mod questions;
mod webhook;

pub use model::{
    parse_structured_output, AnswerOutput, AnswersOutput, CallScriptOutput, CoverLetterOutput,
    GeminiClient, ModelClient, ModelError, OutputSchema, DEFAULT_GEMINI_MODEL,
};
pub use questions::{parse_application_questions, HtmlQuestionScraper, QuestionScraper};
pub use webhook::{
    HttpWebhookSink, WebhookError, WebhookGeneratedContent, WebhookJobDetails, WebhookMetadata,
    WebhookPayload, WebhookSink, WEBHOOK_TIMEOUT,
};

pub const CRATE_NAME: &str = "prospector-adapters";

/// Fallback bundle used when no bundle exists for a query's slug.
pub const DEFAULT_FIXTURE_FILE: &str = "jobs.json";

/// What one scrape asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub name: String,
    pub query: String,
    pub max_results: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        let query = query.into();
        Self {
            name: slugify(&query),
            query,
            max_results,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("scrape transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reading listing bundle {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing listing bundle {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid selector: {0}")]
    Selector(String),
}

impl Classify for ScrapeError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ScrapeError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            ScrapeError::Transport(err) => classify_reqwest_error(err),
            ScrapeError::Io { .. } | ScrapeError::Parse { .. } | ScrapeError::Selector(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[async_trait]
pub trait JobScraper: Send + Sync {
    /// Normalized listings for `query`, at most `query.max_results` of them.
    /// No results is an empty list, not an error.
    async fn scrape(&self, query: &SearchQuery) -> Result<Vec<JobRecord>, ScrapeError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingBundle {
    Wrapped { jobs: Vec<JobRecord> },
    Bare(Vec<JobRecord>),
}

impl ListingBundle {
    fn into_jobs(self) -> Vec<JobRecord> {
        match self {
            ListingBundle::Wrapped { jobs } | ListingBundle::Bare(jobs) => jobs,
        }
    }
}

/// Serves listings from captured JSON bundles on disk: `<dir>/<slug>.json`,
/// else `<dir>/jobs.json`.
#[derive(Debug, Clone)]
pub struct FixtureJobScraper {
    dir: PathBuf,
}

impl FixtureJobScraper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn resolve_bundle(&self, query: &SearchQuery) -> Result<Option<PathBuf>, ScrapeError> {
        let candidates = [
            self.dir.join(format!("{}.json", slugify(&query.query))),
            self.dir.join(DEFAULT_FIXTURE_FILE),
        ];
        for candidate in candidates {
            let exists = fs::try_exists(&candidate)
                .await
                .map_err(|source| ScrapeError::Io {
                    path: candidate.clone(),
                    source,
                })?;
            if exists {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobScraper for FixtureJobScraper {
    async fn scrape(&self, query: &SearchQuery) -> Result<Vec<JobRecord>, ScrapeError> {
        let Some(path) = self.resolve_bundle(query).await? else {
            info!(query = %query.query, dir = %self.dir.display(), "no listing bundle for query");
            return Ok(Vec::new());
        };

        let text = fs::read_to_string(&path)
            .await
            .map_err(|source| ScrapeError::Io {
                path: path.clone(),
                source,
            })?;
        let bundle: ListingBundle =
            serde_json::from_str(&text).map_err(|source| ScrapeError::Parse {
                path: path.clone(),
                source,
            })?;

        let jobs: Vec<JobRecord> = bundle
            .into_jobs()
            .into_iter()
            .take(query.max_results)
            .map(normalize_record)
            .collect();
        debug!(query = %query.query, path = %path.display(), count = jobs.len(), "loaded listings");
        Ok(jobs)
    }
}

/// Lowercase ASCII slug with runs of other characters collapsed to `-`.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Trims free-text fields, blanks out placeholder values, and applies the
/// client-information and rate cleanups.
pub fn normalize_record(mut record: JobRecord) -> JobRecord {
    record.title = record.title.trim().to_string();
    record.description = record.description.trim().to_string();
    record.experience_level = record.experience_level.trim().to_string();
    record.duration = record.duration.trim().to_string();
    record.rate = non_placeholder(record.rate).map(|r| normalize_rate(&r));
    record.client_information = non_placeholder(record.client_information)
        .map(|c| clean_client_info(&c))
        .filter(|c| !c.is_empty());
    record.apply_url = non_placeholder(record.apply_url);
    record
}

fn non_placeholder(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !matches!(v.as_str(), "nan" | "None" | "null"))
}

/// Flattens the scraped client blurb into one ` | `-separated line.
pub fn clean_client_info(text: &str) -> String {
    let flattened = text
        .replace("\r\n", "\n")
        .replace("\n\n", " | ")
        .replace('\n', " ")
        .replace('*', "");
    flattened
        .split('|')
        .map(|segment| segment.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Joins a rate range split across lines (`$15.00\n-\n$25.00`) into
/// `$15.00-$25.00`. Anything that is not a two-sided numeric range is only
/// trimmed.
pub fn normalize_rate(rate: &str) -> String {
    let trimmed = rate.trim();
    let Some((low, high)) = trimmed.split_once('-') else {
        return trimmed.to_string();
    };
    let low = low.trim().trim_start_matches('$');
    let high = high.trim().trim_start_matches('$');
    if is_amount(low) && is_amount(high) {
        format!("${low}-${high}")
    } else {
        trimmed.to_string()
    }
}

fn is_amount(value: &str) -> bool {
    !value.is_empty()
        && value.chars().next().is_some_and(|c| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
}

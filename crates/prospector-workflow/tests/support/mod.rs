#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use prospector_adapters::{
    JobScraper, ModelClient, ModelError, OutputSchema, QuestionScraper, ScrapeError, SearchQuery,
    WebhookError, WebhookPayload, WebhookSink,
};
use prospector_core::{ApplicationQuestion, JobRecord};
use prospector_storage::{CircuitBreakerConfig, CircuitBreakerRegistry, Clock, ManualClock, ResilientExecutor, RetryPolicy, Sleeper};
use prospector_workflow::{ContentGenerator, JobScorer, ModelGateway, PollerMetrics};
use serde_json::{json, Value as JsonValue};
use tokio::sync::watch;

pub const PROFILE: &str = "Rust engineer, ten years of crawlers and data pipelines.";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).single().expect("valid start")
}

pub fn listing(job_id: &str, title: &str) -> JobRecord {
    let mut record = JobRecord::new(title, format!("{title}: build and run a scraping service."));
    record.job_id = Some(job_id.to_string());
    record.apply_url = Some(format!("https://jobs.example/apply/{job_id}"));
    record
}

/// Answers each schema with a canned payload; scores come from a fixed table.
pub struct ScriptedModel {
    scores: Vec<(String, f64)>,
    fail_cover_letters: bool,
    fail_interview_scripts: bool,
    score_outages: Mutex<usize>,
    calls: Mutex<Vec<OutputSchema>>,
}

impl ScriptedModel {
    pub fn new(scores: &[(&str, f64)]) -> Self {
        Self {
            scores: scores.iter().map(|(id, s)| (id.to_string(), *s)).collect(),
            fail_cover_letters: false,
            fail_interview_scripts: false,
            score_outages: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_cover_letters(mut self) -> Self {
        self.fail_cover_letters = true;
        self
    }

    pub fn failing_interview_scripts(mut self) -> Self {
        self.fail_interview_scripts = true;
        self
    }

    /// The first `calls` scoring requests answer 503.
    pub fn scoring_down_for(self, calls: usize) -> Self {
        *self.score_outages.lock().expect("outage lock") = calls;
        self
    }

    pub fn calls(&self) -> Vec<OutputSchema> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn infer(&self, _prompt: &str, schema: OutputSchema) -> Result<JsonValue, ModelError> {
        self.calls.lock().expect("calls lock").push(schema);
        match schema {
            OutputSchema::JobScores => {
                {
                    let mut outages = self.score_outages.lock().expect("outage lock");
                    if *outages > 0 {
                        *outages -= 1;
                        return Err(ModelError::Server {
                            status: 503,
                            body: "overloaded".into(),
                        });
                    }
                }
                let matches: Vec<JsonValue> = self
                    .scores
                    .iter()
                    .map(|(id, score)| json!({ "job_id": id, "score": score }))
                    .collect();
                Ok(json!({ "matches": matches }))
            }
            OutputSchema::CoverLetter if self.fail_cover_letters => Err(ModelError::Rejected {
                status: 400,
                body: "blocked".into(),
            }),
            OutputSchema::CoverLetter => Ok(json!({ "letter": "I have shipped three crawlers like this one." })),
            OutputSchema::CallScript if self.fail_interview_scripts => Err(ModelError::Rejected {
                status: 400,
                body: "blocked".into(),
            }),
            OutputSchema::CallScript => Ok(json!({ "script": "# Introduction\nThanks for the call." })),
            OutputSchema::Answers => Ok(json!({ "answers": [{ "answer": "Yes, daily." }] })),
        }
    }
}

/// Hands out queued scrape results in order. Once the queue is drained the
/// shutdown signal, if any, is raised.
pub struct SequenceScraper {
    responses: Mutex<VecDeque<Result<Vec<JobRecord>, ScrapeError>>>,
    shutdown: Option<watch::Sender<bool>>,
    queries: Mutex<Vec<SearchQuery>>,
}

impl SequenceScraper {
    pub fn new(responses: Vec<Result<Vec<JobRecord>, ScrapeError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            shutdown: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_when_drained(mut self, shutdown: watch::Sender<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().expect("queries lock").clone()
    }
}

#[async_trait]
impl JobScraper for SequenceScraper {
    async fn scrape(&self, query: &SearchQuery) -> Result<Vec<JobRecord>, ScrapeError> {
        self.queries.lock().expect("queries lock").push(query.clone());
        let (next, drained) = {
            let mut responses = self.responses.lock().expect("responses lock");
            let next = responses.pop_front().unwrap_or_else(|| Ok(Vec::new()));
            (next, responses.is_empty())
        };
        if drained {
            if let Some(shutdown) = &self.shutdown {
                let _ = shutdown.send(true);
            }
        }
        next
    }
}

pub struct StaticQuestions(pub Vec<ApplicationQuestion>);

#[async_trait]
impl QuestionScraper for StaticQuestions {
    async fn scrape_questions(&self, _apply_url: &str) -> Result<Vec<ApplicationQuestion>, ScrapeError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct RecordingWebhook {
    pub fail: bool,
    pub delivered: Mutex<Vec<WebhookPayload>>,
}

#[async_trait]
impl WebhookSink for RecordingWebhook {
    async fn deliver(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        if self.fail {
            return Err(WebhookError::Status { status: 503 });
        }
        self.delivered.lock().expect("webhook lock").push(payload.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeps lock").clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeps lock").push(duration);
    }
}

/// Model gateway, scorer and generator sharing one executor that never
/// retries and never really sleeps.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub executor: ResilientExecutor,
    pub metrics: Arc<PollerMetrics>,
    pub model: Arc<ScriptedModel>,
}

impl Harness {
    pub fn new(model: ScriptedModel) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let breakers = Arc::new(CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let executor = ResilientExecutor::new(breakers, policy)
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        Self {
            clock,
            executor,
            metrics: Arc::new(PollerMetrics::default()),
            model: Arc::new(model),
        }
    }

    pub fn gateway(&self) -> ModelGateway {
        ModelGateway::new(
            Arc::clone(&self.model) as Arc<dyn ModelClient>,
            self.executor.clone(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn scorer(&self) -> JobScorer {
        JobScorer::new(self.gateway(), Arc::from(PROFILE), 7.0)
    }

    pub fn generator(&self, questions: Vec<ApplicationQuestion>, high_value_threshold: f64) -> ContentGenerator {
        ContentGenerator::new(
            self.gateway(),
            Arc::new(StaticQuestions(questions)),
            Arc::from(PROFILE),
            high_value_threshold,
        )
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock) as Arc<dyn Clock>
    }
}

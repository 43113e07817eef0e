//! Prospecting workflow: scoring, content generation, the batch state
//! machine, the scored-collection export and the continuous poller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prospector_adapters::{
    FixtureJobScraper, GeminiClient, HtmlQuestionScraper, HttpWebhookSink, JobScraper, ModelClient,
    QuestionScraper, WebhookSink,
};
use prospector_storage::{
    ApplicationArchive, CircuitBreakerConfig, CircuitBreakerRegistry, Clock, JobStore,
    ResilientExecutor, SystemClock, TokioSleeper,
};
use tokio::sync::watch;
use tracing::info;

mod config;
mod content;
mod export;
mod gateway;
mod graph;
mod metrics;
mod poller;
mod scoring;

pub use config::{
    load_profile, load_search_profiles, parse_search_profiles, PollerConfig, QueryRotation,
    SearchProfile, DEFAULT_SEARCH_QUERY, DEFAULT_WEBHOOK_URL,
};
pub use content::{render_application_document, ContentGenerator, GenerationError, APPLY_PAGE_DEPENDENCY};
pub use export::ScoredJobExporter;
pub use gateway::{ModelGateway, MODEL_DEPENDENCY};
pub use graph::{
    ApplicationWorkflow, BatchState, CurrentJob, WorkflowError, WorkflowRun, WorkflowStep,
    DEFAULT_STEP_LIMIT,
};
pub use metrics::{MetricsSnapshot, PollerMetrics};
pub use poller::{
    error_backoff, shutdown_channel, ContinuousPoller, CycleReport, PollerSettings, PollerSummary,
    WEBHOOK_DEPENDENCY,
};
pub use scoring::{scoring_id, valid_scores, JobScorer, MatchQueue, ScoringOutcome};

pub const CRATE_NAME: &str = "prospector-workflow";

const APPLY_PAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything built once per process from configuration. The breaker
/// registry and metrics are shared by every component created from here.
pub struct Services {
    pub config: PollerConfig,
    pub clock: Arc<dyn Clock>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub executor: ResilientExecutor,
    pub metrics: Arc<PollerMetrics>,
    pub profile: Arc<str>,
    pub scraper: Arc<dyn JobScraper>,
    pub questions: Arc<dyn QuestionScraper>,
    pub model: Arc<dyn ModelClient>,
    pub webhook: Arc<dyn WebhookSink>,
}

impl Services {
    /// Wires the production collaborators. A missing profile or model key is
    /// a startup error.
    pub async fn from_config(config: PollerConfig) -> Result<Self> {
        let profile: Arc<str> = load_profile(&config.profile_path).await?.into();
        let api_key = config
            .gemini_api_key
            .clone()
            .context("GEMINI_API_KEY must be set")?;
        let model = GeminiClient::new(api_key, config.gemini_model.clone())?;
        let webhook = HttpWebhookSink::new(config.webhook_url.clone())?;
        let questions = HtmlQuestionScraper::new(APPLY_PAGE_TIMEOUT)?;
        let scraper = FixtureJobScraper::new(config.fixtures_dir.clone());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let breakers = Arc::new(CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig::default(),
            Arc::clone(&clock),
        ));
        let executor = ResilientExecutor::new(Arc::clone(&breakers), config.retry_policy)
            .with_sleeper(Arc::new(TokioSleeper));

        info!(
            model = %config.gemini_model,
            fixtures = %config.fixtures_dir.display(),
            webhook = %config.webhook_url,
            "services configured"
        );

        Ok(Self {
            config,
            clock,
            breakers,
            executor,
            metrics: Arc::new(PollerMetrics::default()),
            profile,
            scraper: Arc::new(scraper),
            questions: Arc::new(questions),
            model: Arc::new(model),
            webhook: Arc::new(webhook),
        })
    }

    pub fn gateway(&self) -> ModelGateway {
        ModelGateway::new(
            Arc::clone(&self.model),
            self.executor.clone(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn scorer(&self) -> JobScorer {
        JobScorer::new(
            self.gateway(),
            Arc::clone(&self.profile),
            self.config.match_threshold,
        )
    }

    pub fn generator(&self) -> ContentGenerator {
        ContentGenerator::new(
            self.gateway(),
            Arc::clone(&self.questions),
            Arc::clone(&self.profile),
            self.config.high_value_threshold,
        )
    }

    pub fn workflow(&self) -> ApplicationWorkflow {
        ApplicationWorkflow::new(
            Arc::clone(&self.scraper),
            self.scorer(),
            self.generator(),
            ApplicationArchive::new(self.config.applications_dir.clone()),
            ScoredJobExporter::new(self.config.exports_dir.clone()),
            Arc::clone(&self.clock),
        )
    }

    pub async fn poller(&self, shutdown: watch::Receiver<bool>) -> Result<ContinuousPoller> {
        let store = JobStore::open_with_clock(self.config.tracking_dir.clone(), Arc::clone(&self.clock))
            .await
            .with_context(|| format!("opening job ledger in {}", self.config.tracking_dir.display()))?;
        let rotation = QueryRotation::from_config(&self.config).await?;
        Ok(ContinuousPoller::new(
            Arc::clone(&self.scraper),
            self.scorer(),
            self.generator(),
            Arc::clone(&self.webhook),
            self.executor.clone(),
            store,
            ApplicationArchive::new(self.config.applications_dir.clone()),
            rotation,
            PollerSettings {
                poll_interval: self.config.poll_interval,
                job_retention_days: self.config.job_retention_days,
                match_threshold: self.config.match_threshold,
                high_value_threshold: self.config.high_value_threshold,
            },
            Arc::clone(&self.clock),
            Arc::new(TokioSleeper),
            Arc::clone(&self.metrics),
            shutdown,
        ))
    }
}

//! Long-running driver: scrape, score, dedupe into the ledger, generate for
//! everything still unprocessed, notify, clean up, sleep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prospector_adapters::{JobScraper, SearchQuery, WebhookPayload, WebhookSink};
use prospector_core::{truncate_for_log, JobRecord, MatchedJob, ProcessingResult};
use prospector_storage::{
    ApplicationArchive, CleanupReport, Clock, JobStore, ResilientExecutor, Sleeper,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::QueryRotation;
use crate::content::{render_application_document, ContentGenerator};
use crate::metrics::PollerMetrics;
use crate::scoring::JobScorer;

/// Circuit name for webhook deliveries.
pub const WEBHOOK_DEPENDENCY: &str = "webhook";

const CLEANUP_EVERY_HOURS: i64 = 24;
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Delay after a failed cycle: twice the poll interval, capped at 300s.
pub fn error_backoff(poll_interval: Duration) -> Duration {
    poll_interval.saturating_mul(2).min(MAX_ERROR_BACKOFF)
}

pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub job_retention_days: u32,
    pub match_threshold: f64,
    pub high_value_threshold: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub query: String,
    pub scraped: usize,
    pub newly_seen: usize,
    /// New listings left out of the ledger because their scoring batch failed.
    pub unscored: usize,
    pub unprocessed: usize,
    pub generated: usize,
    pub below_threshold: usize,
    pub failed: usize,
    pub webhooks_delivered: usize,
    pub webhook_failures: usize,
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollerSummary {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
}

pub struct ContinuousPoller {
    scraper: Arc<dyn JobScraper>,
    scorer: JobScorer,
    generator: ContentGenerator,
    webhook: Arc<dyn WebhookSink>,
    executor: ResilientExecutor,
    store: JobStore,
    archive: ApplicationArchive,
    rotation: QueryRotation,
    settings: PollerSettings,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<PollerMetrics>,
    shutdown: watch::Receiver<bool>,
    last_cleanup: DateTime<Utc>,
}

impl ContinuousPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scraper: Arc<dyn JobScraper>,
        scorer: JobScorer,
        generator: ContentGenerator,
        webhook: Arc<dyn WebhookSink>,
        executor: ResilientExecutor,
        store: JobStore,
        archive: ApplicationArchive,
        rotation: QueryRotation,
        settings: PollerSettings,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        metrics: Arc<PollerMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let last_cleanup = clock.now();
        Self {
            scraper,
            scorer,
            generator,
            webhook,
            executor,
            store,
            archive,
            rotation,
            settings,
            clock,
            sleeper,
            metrics,
            shutdown,
            last_cleanup,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<PollerMetrics> {
        &self.metrics
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs cycles until shutdown is signalled. A failed cycle is logged and
    /// followed by the error backoff; it never ends the loop.
    pub async fn run(&mut self) -> PollerSummary {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            queries = self.rotation.len(),
            "poller started"
        );
        let mut summary = PollerSummary::default();

        loop {
            if self.shutdown_requested() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(report) => {
                    summary.cycles_completed += 1;
                    self.metrics.inc_cycles_completed();
                    info!(
                        query = %report.query,
                        scraped = report.scraped,
                        newly_seen = report.newly_seen,
                        unscored = report.unscored,
                        generated = report.generated,
                        failed = report.failed,
                        "poll cycle completed"
                    );
                    self.settings.poll_interval
                }
                Err(err) => {
                    summary.cycles_failed += 1;
                    self.metrics.inc_cycles_failed();
                    let backoff = error_backoff(self.settings.poll_interval);
                    error!(
                        error = %truncate_for_log(&format!("{err:#}")),
                        backoff_secs = backoff.as_secs(),
                        "poll cycle failed"
                    );
                    backoff
                }
            };

            if !self.pause(delay).await {
                break;
            }
        }

        info!(
            completed = summary.cycles_completed,
            failed = summary.cycles_failed,
            "poller stopped"
        );
        summary
    }

    /// Sleeps for `delay` unless shutdown arrives first. Returns whether the
    /// loop should keep going.
    async fn pause(&mut self, delay: Duration) -> bool {
        if self.shutdown_requested() {
            return false;
        }
        debug!(delay_secs = delay.as_secs(), "sleeping until next cycle");
        let sleeper = Arc::clone(&self.sleeper);
        tokio::select! {
            _ = sleeper.sleep(delay) => {}
            changed = self.shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can signal shutdown any more.
                    sleeper.sleep(delay).await;
                }
            }
        }
        !self.shutdown_requested()
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let query = self.rotation.next_query();
        let mut report = CycleReport {
            query: query.query.clone(),
            ..CycleReport::default()
        };
        info!(query = %query.query, profile = %query.name, "polling for new jobs");

        let jobs = self
            .scraper
            .scrape(&query)
            .await
            .with_context(|| format!("scraping '{}'", query.query))?;
        report.scraped = jobs.len();
        self.metrics.add_scraped(jobs.len());
        if jobs.is_empty() {
            warn!(query = %query.query, "no jobs found in this poll");
        }

        let scored = self.scorer.score(jobs).await;
        for record in &scored.jobs {
            if self.store.is_seen(record) {
                continue;
            }
            if record.score.is_none() {
                debug!(title = %record.title, "job left unscored, will be rescored next poll");
                report.unscored += 1;
                continue;
            }
            let job_id = self.store.mark_seen(record).await.context("recording seen job")?;
            debug!(%job_id, "new job recorded");
            report.newly_seen += 1;
        }

        let unprocessed = self.store.get_unprocessed();
        report.unprocessed = unprocessed.len();
        self.metrics.set_queue_depth(unprocessed.len());

        for (job_id, record) in unprocessed {
            self.process_job(&job_id, &record, &query, &mut report).await?;
        }

        if self.clock.now() - self.last_cleanup >= chrono::Duration::hours(CLEANUP_EVERY_HOURS) {
            info!(retention_days = self.settings.job_retention_days, "running daily cleanup");
            let cleanup = self
                .store
                .cleanup(self.settings.job_retention_days)
                .await
                .context("cleaning up job ledger")?;
            self.last_cleanup = self.clock.now();
            report.cleanup = Some(cleanup);
        }

        self.metrics.set_queue_depth(self.store.get_unprocessed().len());
        Ok(report)
    }

    /// Generation failures skip the job and leave it unprocessed; ledger
    /// write failures abort the cycle.
    async fn process_job(
        &mut self,
        job_id: &str,
        record: &JobRecord,
        query: &SearchQuery,
        report: &mut CycleReport,
    ) -> Result<()> {
        let score = record.score_or_zero();
        if score < self.settings.match_threshold {
            let result = ProcessingResult::below_threshold(job_id, score, self.clock.now());
            self.store
                .mark_processed(job_id, result)
                .await
                .context("recording below-threshold job")?;
            report.below_threshold += 1;
            return Ok(());
        }

        let mut job = MatchedJob::from_record(record);
        job.job_id = job_id.to_string();

        let artifacts = match self.generator.generate(&job, self.clock.now()).await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                if err.is_circuit_open() {
                    debug!(job_id, "generation skipped by open circuit");
                }
                warn!(
                    job_id,
                    error = %truncate_for_log(&err.to_string()),
                    "job processing failed, will retry next cycle"
                );
                report.failed += 1;
                self.metrics.inc_failed();
                return Ok(());
            }
        };

        let document = render_application_document(&job, &artifacts);
        if let Err(err) = self
            .archive
            .store_document(artifacts.generated_at, job_id, &document)
            .await
        {
            warn!(job_id, error = %format!("{err:#}"), "saving application document failed");
        }

        let mut delivered = false;
        if self.generator.is_high_value(score) {
            self.metrics.inc_high_value();
            let payload = WebhookPayload::new(job_id, record, &artifacts, &query.query, self.clock.now());
            let webhook = Arc::clone(&self.webhook);
            match self
                .executor
                .call(WEBHOOK_DEPENDENCY, || webhook.deliver(&payload))
                .await
            {
                Ok(()) => {
                    delivered = true;
                    report.webhooks_delivered += 1;
                    info!(job_id, "webhook notification sent");
                }
                Err(err) => {
                    report.webhook_failures += 1;
                    self.metrics.inc_webhook_failures();
                    if err.is_circuit_open() {
                        self.metrics.inc_circuit_rejections();
                    }
                    error!(
                        job_id,
                        error = %truncate_for_log(&err.to_string()),
                        "webhook notification failed"
                    );
                }
            }
        }

        self.store
            .mark_processed(job_id, ProcessingResult::generated(&artifacts, score, delivered))
            .await
            .context("recording processed job")?;
        report.generated += 1;
        self.metrics.inc_processed();
        info!(job_id, score, "job processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_interval_up_to_five_minutes() {
        assert_eq!(error_backoff(Duration::from_secs(60)), Duration::from_secs(120));
        assert_eq!(error_backoff(Duration::from_secs(150)), Duration::from_secs(300));
        assert_eq!(error_backoff(Duration::from_secs(480)), Duration::from_secs(300));
    }
}

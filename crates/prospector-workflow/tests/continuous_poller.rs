mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prospector_adapters::{ScrapeError, SearchQuery};
use prospector_core::{JobRecord, ProcessingStatus};
use prospector_storage::{ApplicationArchive, JobStore};
use prospector_workflow::{shutdown_channel, ContinuousPoller, PollerSettings, QueryRotation};
use support::{listing, Harness, RecordingSleeper, RecordingWebhook, ScriptedModel, SequenceScraper};
use tempfile::tempdir;
use tokio::sync::watch;

fn settings(poll_interval: Duration) -> PollerSettings {
    PollerSettings {
        poll_interval,
        job_retention_days: 30,
        match_threshold: 7.0,
        high_value_threshold: 9.0,
    }
}

async fn poller(
    harness: &Harness,
    scraper: Arc<SequenceScraper>,
    webhook: Arc<RecordingWebhook>,
    sleeper: Arc<RecordingSleeper>,
    root: &Path,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> ContinuousPoller {
    let store = JobStore::open_with_clock(root.join("tracking"), harness.clock())
        .await
        .expect("open store");
    ContinuousPoller::new(
        scraper,
        harness.scorer(),
        harness.generator(Vec::new(), 9.0),
        webhook,
        harness.executor.clone(),
        store,
        ApplicationArchive::new(root.join("applications")),
        QueryRotation::single(SearchQuery::new("rust crawler", 10)),
        settings(poll_interval),
        harness.clock(),
        sleeper,
        Arc::clone(&harness.metrics),
        shutdown,
    )
}

#[tokio::test]
async fn failed_cycle_backs_off_then_recovers() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("ok-1", 8.0)]));
    let (tx, rx) = shutdown_channel();
    let scraper = Arc::new(
        SequenceScraper::new(vec![
            Err(ScrapeError::Selector("listing page changed".into())),
            Ok(vec![listing("ok-1", "Rust crawler")]),
        ])
        .shutdown_when_drained(tx),
    );
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut poller = poller(
        &harness,
        Arc::clone(&scraper),
        Arc::new(RecordingWebhook::default()),
        Arc::clone(&sleeper),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let summary = poller.run().await;

    assert_eq!(summary.cycles_failed, 1);
    assert_eq!(summary.cycles_completed, 1);
    assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(120)]);
    assert_eq!(scraper.queries().len(), 2);
    assert!(poller.store().is_processed("ok-1"));

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.cycles_failed, 1);
    assert_eq!(snapshot.cycles_completed, 1);
    assert_eq!(snapshot.jobs_processed, 1);
}

#[tokio::test]
async fn jobs_are_processed_once_across_cycles() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("keep", 8.0), ("skip", 2.0)]));
    let (_tx, rx) = shutdown_channel();
    let batch = vec![listing("keep", "Rust crawler"), listing("skip", "Logo design")];
    let scraper = Arc::new(SequenceScraper::new(vec![Ok(batch.clone()), Ok(batch)]));
    let mut poller = poller(
        &harness,
        scraper,
        Arc::new(RecordingWebhook::default()),
        Arc::new(RecordingSleeper::default()),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let first = poller.run_cycle().await.expect("first cycle");
    assert_eq!(first.newly_seen, 2);
    assert_eq!(first.generated, 1);
    assert_eq!(first.below_threshold, 1);

    let second = poller.run_cycle().await.expect("second cycle");
    assert_eq!(second.newly_seen, 0);
    assert_eq!(second.unprocessed, 0);
    assert_eq!(second.generated, 0);

    let skipped = poller.store().processed_job("skip").expect("skip processed");
    assert_eq!(skipped.result.status, ProcessingStatus::BelowThreshold);
    let kept = poller.store().processed_job("keep").expect("keep processed");
    assert_eq!(kept.result.status, ProcessingStatus::Generated);
    assert!(kept
        .result
        .cover_letter
        .as_deref()
        .is_some_and(|letter| letter.starts_with("Hello")));
    assert!(!kept.result.webhook_delivered);
}

#[tokio::test]
async fn high_value_jobs_reach_the_webhook() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("star", 9.5)]));
    let (_tx, rx) = shutdown_channel();
    let scraper = Arc::new(SequenceScraper::new(vec![Ok(vec![listing("star", "Lead crawler engineer")])]));
    let webhook = Arc::new(RecordingWebhook::default());
    let mut poller = poller(
        &harness,
        scraper,
        Arc::clone(&webhook),
        Arc::new(RecordingSleeper::default()),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let report = poller.run_cycle().await.expect("cycle");
    assert_eq!(report.webhooks_delivered, 1);

    let delivered = webhook.delivered.lock().expect("webhook lock").clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].job_details.id, "star");
    assert_eq!(delivered[0].metadata.search_query, "rust crawler");
    assert!(delivered[0].generated_content.cover_letter.starts_with("Hello"));

    let processed = poller.store().processed_job("star").expect("processed");
    assert!(processed.result.webhook_delivered);
}

#[tokio::test]
async fn webhook_failure_still_finalizes_the_job() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("star", 9.5)]));
    let (_tx, rx) = shutdown_channel();
    let scraper = Arc::new(SequenceScraper::new(vec![Ok(vec![listing("star", "Lead crawler engineer")])]));
    let webhook = Arc::new(RecordingWebhook {
        fail: true,
        ..RecordingWebhook::default()
    });
    let mut poller = poller(
        &harness,
        scraper,
        webhook,
        Arc::new(RecordingSleeper::default()),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let report = poller.run_cycle().await.expect("cycle");
    assert_eq!(report.webhook_failures, 1);
    assert_eq!(harness.metrics.snapshot().webhook_failures, 1);

    let processed = poller.store().processed_job("star").expect("processed");
    assert!(!processed.result.webhook_delivered);
}

#[tokio::test]
async fn generation_failure_leaves_job_for_next_cycle() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("retry-me", 8.0)]).failing_cover_letters());
    let (_tx, rx) = shutdown_channel();
    let scraper = Arc::new(SequenceScraper::new(vec![Ok(vec![listing("retry-me", "Rust crawler")])]));
    let mut poller = poller(
        &harness,
        scraper,
        Arc::new(RecordingWebhook::default()),
        Arc::new(RecordingSleeper::default()),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let report = poller.run_cycle().await.expect("cycle");
    assert_eq!(report.failed, 1);
    assert!(!poller.store().is_processed("retry-me"));
    assert!(poller.store().get_unprocessed().contains_key("retry-me"));
}

#[tokio::test]
async fn cleanup_runs_after_a_day_and_prunes_old_entries() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("old", 2.0)]));
    let (_tx, rx) = shutdown_channel();
    let scraper = Arc::new(SequenceScraper::new(vec![
        Ok(vec![listing("old", "Logo design")]),
        Ok(Vec::<JobRecord>::new()),
    ]));
    let mut poller = poller(
        &harness,
        scraper,
        Arc::new(RecordingWebhook::default()),
        Arc::new(RecordingSleeper::default()),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let first = poller.run_cycle().await.expect("first cycle");
    assert!(first.cleanup.is_none());
    assert!(poller.store().is_processed("old"));

    harness.clock.advance(Duration::from_secs(40 * 24 * 3600));
    let second = poller.run_cycle().await.expect("second cycle");
    let cleanup = second.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.processed_removed, 1);
    assert_eq!(cleanup.seen_removed, 1);
    assert_eq!(poller.store().seen_len(), 0);
}

#[tokio::test]
async fn scoring_outage_keeps_jobs_for_the_next_cycle() {
    let dir = tempdir().expect("tempdir");
    let harness = Harness::new(ScriptedModel::new(&[("j1", 9.0)]).scoring_down_for(1));
    let (_tx, rx) = shutdown_channel();
    let batch = vec![listing("j1", "Rust crawler")];
    let scraper = Arc::new(SequenceScraper::new(vec![Ok(batch.clone()), Ok(batch)]));
    let mut poller = poller(
        &harness,
        scraper,
        Arc::new(RecordingWebhook::default()),
        Arc::new(RecordingSleeper::default()),
        dir.path(),
        Duration::from_secs(60),
        rx,
    )
    .await;

    let first = poller.run_cycle().await.expect("first cycle");
    assert_eq!(first.unscored, 1);
    assert_eq!(first.newly_seen, 0);
    assert_eq!(first.below_threshold, 0);
    assert!(!poller.store().is_processed("j1"));

    let second = poller.run_cycle().await.expect("second cycle");
    assert_eq!(second.unscored, 0);
    assert_eq!(second.newly_seen, 1);
    assert_eq!(second.generated, 1);

    let processed = poller.store().processed_job("j1").expect("j1 processed");
    assert_eq!(processed.result.status, ProcessingStatus::Generated);
    assert_eq!(processed.result.score, 9.0);
}

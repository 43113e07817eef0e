use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process counters read by the health listener.
#[derive(Debug, Default)]
pub struct PollerMetrics {
    jobs_scraped: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    high_value_jobs: AtomicU64,
    webhook_failures: AtomicU64,
    circuit_rejections: AtomicU64,
    jobs_in_queue: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    last_model_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_scraped: u64,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub high_value_jobs: u64,
    pub webhook_failures: u64,
    pub circuit_rejections: u64,
    pub jobs_in_queue: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub last_model_latency_ms: u64,
}

impl PollerMetrics {
    pub fn add_scraped(&self, count: usize) {
        self.jobs_scraped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_high_value(&self) {
        self.high_value_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_failures(&self) {
        self.webhook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_rejections(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.jobs_in_queue.store(depth as u64, Ordering::Relaxed);
    }

    pub fn inc_cycles_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cycles_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_latency_ms(&self, millis: u64) {
        self.last_model_latency_ms.store(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_scraped: self.jobs_scraped.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            high_value_jobs: self.high_value_jobs.load(Ordering::Relaxed),
            webhook_failures: self.webhook_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            jobs_in_queue: self.jobs_in_queue.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            last_model_latency_ms: self.last_model_latency_ms.load(Ordering::Relaxed),
        }
    }
}

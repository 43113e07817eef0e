//! Seen/processed job ledger persisted as two JSON documents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prospector_core::{content_id, JobRecord, ProcessingResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::write_atomic;

pub const SEEN_JOBS_FILE: &str = "seen_jobs.json";
pub const PROCESSED_JOBS_FILE: &str = "processed_jobs.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenJob {
    pub first_seen_at: DateTime<Utc>,
    pub content_hash: String,
    pub job: JobRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedJob {
    pub processed_at: DateTime<Utc>,
    pub result: ProcessingResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub processed_removed: usize,
    pub seen_removed: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger document {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing ledger document {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable record of every job seen and every job finalized.
///
/// The in-memory maps are authoritative once opened. Each mutation is applied
/// to a copy, the whole document is rewritten atomically, and only then is
/// the copy committed. A single writer process is assumed.
pub struct JobStore {
    root: PathBuf,
    seen_path: PathBuf,
    processed_path: PathBuf,
    seen: BTreeMap<String, SeenJob>,
    processed: BTreeMap<String, ProcessedJob>,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_clock(root, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;

        let seen_path = root.join(SEEN_JOBS_FILE);
        let processed_path = root.join(PROCESSED_JOBS_FILE);
        let seen: BTreeMap<String, SeenJob> = load_document(&seen_path).await?;
        let processed: BTreeMap<String, ProcessedJob> = load_document(&processed_path).await?;
        debug!(
            root = %root.display(),
            seen = seen.len(),
            processed = processed.len(),
            "job ledger opened"
        );

        Ok(Self {
            root,
            seen_path,
            processed_path,
            seen,
            processed,
            clock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    pub fn seen_job(&self, job_id: &str) -> Option<&SeenJob> {
        self.seen.get(job_id)
    }

    pub fn processed_job(&self, job_id: &str) -> Option<&ProcessedJob> {
        self.processed.get(job_id)
    }

    pub fn is_processed(&self, job_id: &str) -> bool {
        self.processed.contains_key(job_id)
    }

    fn find_by_content(&self, content_hash: &str) -> Option<&str> {
        self.seen
            .iter()
            .find(|(_, entry)| entry.content_hash == content_hash)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_seen(&self, record: &JobRecord) -> bool {
        if let Some(id) = record.stable_id() {
            return self.seen.contains_key(id);
        }
        if !record.has_content() {
            return false;
        }
        let hash = record.content_hash();
        self.seen.contains_key(&content_id(&hash)) || self.find_by_content(&hash).is_some()
    }

    /// Ledger key for a record: its stable id, the key of an already-seen
    /// record with identical content, or a freshly derived id.
    pub fn job_id_for(&self, record: &JobRecord) -> String {
        if let Some(id) = record.stable_id() {
            return id.to_string();
        }
        if record.has_content() {
            if let Some(existing) = self.find_by_content(&record.content_hash()) {
                return existing.to_string();
            }
        }
        record.fallback_id()
    }

    /// Records a sighting and returns the assigned id. Marking the same
    /// content twice keeps one entry and its original `first_seen_at`.
    pub async fn mark_seen(&mut self, record: &JobRecord) -> Result<String, StoreError> {
        let job_id = self.job_id_for(record);
        let mut job = record.clone();
        job.job_id = Some(job_id.clone());

        let mut seen = self.seen.clone();
        let first_seen_at = seen
            .get(&job_id)
            .map(|entry| entry.first_seen_at)
            .unwrap_or_else(|| self.clock.now());
        seen.insert(
            job_id.clone(),
            SeenJob {
                first_seen_at,
                content_hash: record.content_hash(),
                job,
            },
        );

        persist(&self.seen_path, &seen).await?;
        self.seen = seen;
        Ok(job_id)
    }

    pub async fn mark_processed(
        &mut self,
        job_id: &str,
        result: ProcessingResult,
    ) -> Result<(), StoreError> {
        if !self.seen.contains_key(job_id) {
            debug!(job_id, "marking job processed without a seen entry");
        }

        let mut processed = self.processed.clone();
        processed.insert(
            job_id.to_string(),
            ProcessedJob {
                processed_at: self.clock.now(),
                result,
            },
        );

        persist(&self.processed_path, &processed).await?;
        self.processed = processed;
        Ok(())
    }

    /// Seen jobs with no processed entry, keyed by id.
    pub fn get_unprocessed(&self) -> BTreeMap<String, JobRecord> {
        self.seen
            .iter()
            .filter(|(id, _)| !self.processed.contains_key(*id))
            .map(|(id, entry)| (id.clone(), entry.job.clone()))
            .collect()
    }

    /// Drops processed entries older than the retention window, then seen
    /// entries that are older than the window and have no processed entry.
    pub async fn cleanup(&mut self, retention_days: u32) -> Result<CleanupReport, StoreError> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(retention_days));

        let mut processed = self.processed.clone();
        processed.retain(|_, entry| entry.processed_at > cutoff);

        let mut seen = self.seen.clone();
        seen.retain(|id, entry| processed.contains_key(id) || entry.first_seen_at > cutoff);

        let report = CleanupReport {
            processed_removed: self.processed.len() - processed.len(),
            seen_removed: self.seen.len() - seen.len(),
        };

        persist(&self.processed_path, &processed).await?;
        persist(&self.seen_path, &seen).await?;
        self.processed = processed;
        self.seen = seen;

        info!(
            retention_days,
            processed_removed = report.processed_removed,
            seen_removed = report.seen_removed,
            "job ledger cleanup finished"
        );
        Ok(report)
    }
}

async fn load_document<T: DeserializeOwned + Default + Serialize>(path: &Path) -> Result<T, StoreError> {
    let exists = fs::try_exists(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !exists {
        let empty = T::default();
        persist(path, &empty).await?;
        return Ok(empty);
    }

    let text = fs::read_to_string(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

async fn persist<T: Serialize>(path: &Path, document: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(document).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

//! Durable state for the prospector: the job ledger, the application document
//! archive, and the resilience primitives shared by every external call.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod clock;
mod ledger;
mod resilience;

pub use clock::{Clock, ManualClock, Sleeper, SystemClock, TokioSleeper};
pub use ledger::{
    CleanupReport, JobStore, ProcessedJob, SeenJob, StoreError, PROCESSED_JOBS_FILE,
    SEEN_JOBS_FILE,
};
pub use resilience::{
    classify_reqwest_error, classify_status, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitSnapshot, CircuitState, Classify, ResilienceError,
    ResilientExecutor, RetryDisposition, RetryPolicy,
};

pub const CRATE_NAME: &str = "prospector-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// never observe a partially written document.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Markdown application documents, one per generated application, grouped
/// into a directory per generation day.
#[derive(Debug, Clone)]
pub struct ApplicationArchive {
    root: PathBuf,
}

impl ApplicationArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_relative_path(
        &self,
        generated_at: DateTime<Utc>,
        job_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let day = generated_at.format("%Y%m%d").to_string();
        let short_hash: String = content_hash.chars().take(12).collect();
        PathBuf::from(day).join(format!("{}-{short_hash}.md", sanitize_file_stem(job_id)))
    }

    /// Writes the document unless an identical one already exists for the
    /// same day and job.
    pub async fn store_document(
        &self,
        generated_at: DateTime<Utc>,
        job_id: &str,
        contents: &str,
    ) -> anyhow::Result<StoredDocument> {
        let bytes = contents.as_bytes();
        let content_hash = sha256_hex(bytes);
        let relative_path = self.document_relative_path(generated_at, job_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking document path {}", absolute_path.display()))?
        {
            return Ok(StoredDocument {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, bytes)
            .await
            .with_context(|| format!("writing application document {}", absolute_path.display()))?;

        Ok(StoredDocument {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

fn sanitize_file_stem(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_whole_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doc.json");
        write_atomic(&path, b"{\"a\":1}").await.expect("first");
        write_atomic(&path, b"{}").await.expect("second");
        assert_eq!(std::fs::read(&path).expect("read"), b"{}");

        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn documents_deduplicate_by_day_and_hash() {
        let dir = tempdir().expect("tempdir");
        let archive = ApplicationArchive::new(dir.path());
        let generated_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_document(generated_at, "~01abc/def", "# Cover Letter\nHello")
            .await
            .expect("first store");
        let second = archive
            .store_document(generated_at, "~01abc/def", "# Cover Letter\nHello")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224"));
        let name = first
            .relative_path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with("_01abc_def-"));
        assert!(name.ends_with(".md"));
        assert!(first.absolute_path.exists());
    }
}

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use prospector_core::JobRecord;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

/// Writes the whole scored collection, matches and non-matches alike, to one
/// Parquet file per calendar day. A later run on the same day replaces it.
#[derive(Debug, Clone)]
pub struct ScoredJobExporter {
    dir: PathBuf,
}

impl ScoredJobExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("scored_jobs_{}.parquet", day.format("%Y-%m-%d")))
    }

    pub async fn export(&self, jobs: &[JobRecord], day: NaiveDate) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.path_for(day);
        let temp_path = self.dir.join(format!(".{}.parquet.tmp", Uuid::new_v4()));
        let batch = scored_jobs_batch(jobs)?;
        if let Err(err) = write_parquet(&temp_path, batch) {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("moving export into place at {}", path.display()))?;

        info!(path = %path.display(), rows = jobs.len(), "scored jobs exported");
        Ok(path)
    }
}

fn scored_jobs_batch(jobs: &[JobRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("job_id", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
        ArrowField::new("job_type", DataType::Utf8, true),
        ArrowField::new("experience_level", DataType::Utf8, false),
        ArrowField::new("duration", DataType::Utf8, false),
        ArrowField::new("rate", DataType::Utf8, true),
        ArrowField::new("client_information", DataType::Utf8, true),
        ArrowField::new("apply_url", DataType::Utf8, true),
        ArrowField::new("score", DataType::Float64, false),
    ]));

    let job_ids = StringArray::from(jobs.iter().map(|j| j.stable_id()).collect::<Vec<_>>());
    let titles = StringArray::from(jobs.iter().map(|j| Some(j.title.as_str())).collect::<Vec<_>>());
    let descriptions = StringArray::from(
        jobs.iter()
            .map(|j| Some(j.description.as_str()))
            .collect::<Vec<_>>(),
    );
    let job_types = StringArray::from(
        jobs.iter()
            .map(|j| j.job_type.map(|t| t.as_str()))
            .collect::<Vec<_>>(),
    );
    let experience = StringArray::from(
        jobs.iter()
            .map(|j| Some(j.experience_level.as_str()))
            .collect::<Vec<_>>(),
    );
    let durations = StringArray::from(jobs.iter().map(|j| Some(j.duration.as_str())).collect::<Vec<_>>());
    let rates = StringArray::from(jobs.iter().map(|j| j.rate.as_deref()).collect::<Vec<_>>());
    let clients = StringArray::from(
        jobs.iter()
            .map(|j| j.client_information.as_deref())
            .collect::<Vec<_>>(),
    );
    let apply_urls = StringArray::from(jobs.iter().map(|j| j.apply_url.as_deref()).collect::<Vec<_>>());
    let scores = Float64Array::from(jobs.iter().map(JobRecord::score_or_zero).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(job_ids),
            Arc::new(titles),
            Arc::new(descriptions),
            Arc::new(job_types),
            Arc::new(experience),
            Arc::new(durations),
            Arc::new(rates),
            Arc::new(clients),
            Arc::new(apply_urls),
            Arc::new(scores),
        ],
    )
    .context("building scored jobs record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

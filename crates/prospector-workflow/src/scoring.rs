use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use prospector_adapters::{prompts, OutputSchema};
use prospector_core::{truncate_for_log, JobRecord, MatchedJob, SCORING_BATCH_SIZE};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::gateway::ModelGateway;

/// Matched jobs awaiting generation. Last pushed is processed first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchQueue {
    items: VecDeque<MatchedJob>,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: MatchedJob) {
        self.items.push_back(job);
    }

    pub fn pop(&mut self) -> Option<MatchedJob> {
        self.items.pop_back()
    }

    pub fn peek(&self) -> Option<&MatchedJob> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queued jobs in the order they will be processed.
    pub fn iter(&self) -> impl Iterator<Item = &MatchedJob> {
        self.items.iter().rev()
    }

    /// `Title/Description` blocks in processing order.
    pub fn prompt_texts(&self) -> Vec<String> {
        self.iter().map(MatchedJob::prompt_text).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScoringOutcome {
    /// Every input record. Records in a batch the model answered carry a
    /// score (0.0 when omitted); records in a failed batch stay `None`.
    pub jobs: Vec<JobRecord>,
    pub matches: MatchQueue,
}

impl ScoringOutcome {
    /// Records whose batch failed and that must be scored again later.
    pub fn unscored(&self) -> usize {
        self.jobs.iter().filter(|job| job.score.is_none()).count()
    }
}

/// Id the model is asked to echo back for a record. Records without a
/// stable id get `idx-<n>`, which no scraped listing id uses.
pub fn scoring_id(record: &JobRecord, index: usize) -> String {
    record
        .stable_id()
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("idx-{index}"))
}

/// Keeps entries with an id and a numeric score in `[1, 10]`; anything else
/// is dropped without failing the batch.
pub fn valid_scores(response: &JsonValue) -> Vec<(String, f64)> {
    let Some(matches) = response.get("matches").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    matches
        .iter()
        .filter_map(|entry| {
            let job_id = match entry.get("job_id")? {
                JsonValue::String(id) => id.trim().to_string(),
                JsonValue::Number(n) => n.to_string(),
                _ => return None,
            };
            let score = entry.get("score")?.as_f64()?;
            if job_id.is_empty() || !(1.0..=10.0).contains(&score) {
                return None;
            }
            Some((job_id, score))
        })
        .collect()
}

pub struct JobScorer {
    gateway: ModelGateway,
    profile: Arc<str>,
    threshold: f64,
}

impl JobScorer {
    pub fn new(gateway: ModelGateway, profile: Arc<str>, threshold: f64) -> Self {
        Self {
            gateway,
            profile,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Scores `jobs` in batches of five. Ids the model omits score 0.0. A
    /// failed batch leaves its records unscored and scoring carries on with
    /// the next batch.
    pub async fn score(&self, mut jobs: Vec<JobRecord>) -> ScoringOutcome {
        let ids: Vec<String> = jobs
            .iter()
            .enumerate()
            .map(|(idx, job)| scoring_id(job, idx))
            .collect();
        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut failed_batches: HashSet<usize> = HashSet::new();

        for (batch_no, chunk) in jobs.chunks(SCORING_BATCH_SIZE).enumerate() {
            let offset = batch_no * SCORING_BATCH_SIZE;
            let batch: Vec<(String, &JobRecord)> = chunk
                .iter()
                .enumerate()
                .map(|(i, job)| (ids[offset + i].clone(), job))
                .collect();
            let prompt = prompts::score_jobs(&self.profile, &batch);

            match self.gateway.infer(&prompt, OutputSchema::JobScores).await {
                Ok(response) => {
                    let valid = valid_scores(&response);
                    debug!(batch = batch_no, returned = valid.len(), "scored batch");
                    scores.extend(valid);
                }
                Err(err) => {
                    warn!(
                        batch = batch_no,
                        size = chunk.len(),
                        error = %truncate_for_log(&err.to_string()),
                        "scoring batch failed, its jobs stay unscored"
                    );
                    failed_batches.insert(batch_no);
                }
            }
        }

        let mut matches = MatchQueue::new();
        for (idx, (job, id)) in jobs.iter_mut().zip(&ids).enumerate() {
            if failed_batches.contains(&(idx / SCORING_BATCH_SIZE)) {
                job.score = None;
                continue;
            }
            job.score = Some(scores.get(id).copied().unwrap_or(0.0));
            if job.is_match(self.threshold) {
                matches.push(MatchedJob::from_record(job));
            }
        }

        info!(
            scored = jobs.len(),
            matched = matches.len(),
            failed_batches = failed_batches.len(),
            threshold = self.threshold,
            "scoring completed"
        );
        ScoringOutcome { jobs, matches }
    }
}

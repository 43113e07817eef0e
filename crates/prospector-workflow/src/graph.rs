//! Finite state machine that drives one batch from scrape to saved
//! applications.
//!
//! Each step takes the [`BatchState`] by value and hands back the next step
//! together with the updated state. Per-job scratch lives in
//! [`CurrentJob`]; a step only fills its own field and the whole scratch area
//! is dropped when the job leaves the worklist.

use std::path::PathBuf;
use std::sync::Arc;

use prospector_adapters::{JobScraper, ScrapeError, SearchQuery};
use prospector_core::{
    truncate_for_log, ApplicationArtifacts, ApplicationQuestion, JobRecord, MatchedJob,
    QuestionAnswer,
};
use prospector_storage::{ApplicationArchive, Clock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::content::{render_application_document, ContentGenerator};
use crate::export::ScoredJobExporter;
use crate::scoring::{JobScorer, MatchQueue};

pub const DEFAULT_STEP_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    Scrape,
    Score,
    CheckMatches,
    GenerateContent,
    CoverLetter,
    ScrapeQuestions,
    GenerateAnswers,
    InterviewScript,
    Save,
    Terminal,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("scrape failed: {0}")]
    Scrape(#[from] ScrapeError),
    #[error("step {step:?} requires a current job")]
    NoCurrentJob { step: WorkflowStep },
    #[error("workflow did not terminate within {limit} steps")]
    StepLimit { limit: usize },
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// Scratch for the job at the top of the worklist.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentJob {
    pub job: MatchedJob,
    pub cover_letter: Option<String>,
    pub questions: Vec<ApplicationQuestion>,
    pub answers: Vec<QuestionAnswer>,
    pub interview_script: Option<String>,
}

impl CurrentJob {
    fn new(job: MatchedJob) -> Self {
        Self {
            job,
            cover_letter: None,
            questions: Vec::new(),
            answers: Vec::new(),
            interview_script: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchState {
    pub query: SearchQuery,
    pub jobs: Vec<JobRecord>,
    pub matches: MatchQueue,
    pub current: Option<CurrentJob>,
    pub saved: Vec<PathBuf>,
    pub skipped: Vec<String>,
    pub export_path: Option<PathBuf>,
}

impl BatchState {
    pub fn new(query: SearchQuery) -> Self {
        Self {
            query,
            jobs: Vec::new(),
            matches: MatchQueue::new(),
            current: None,
            saved: Vec::new(),
            skipped: Vec::new(),
            export_path: None,
        }
    }

    /// Drops the top of the worklist along with its scratch.
    fn finish_current(&mut self) -> Option<MatchedJob> {
        self.current = None;
        self.matches.pop()
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub state: BatchState,
    pub trace: Vec<WorkflowStep>,
}

pub struct ApplicationWorkflow {
    scraper: Arc<dyn JobScraper>,
    scorer: JobScorer,
    generator: ContentGenerator,
    archive: ApplicationArchive,
    exporter: ScoredJobExporter,
    clock: Arc<dyn Clock>,
    step_limit: usize,
}

impl ApplicationWorkflow {
    pub fn new(
        scraper: Arc<dyn JobScraper>,
        scorer: JobScorer,
        generator: ContentGenerator,
        archive: ApplicationArchive,
        exporter: ScoredJobExporter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scraper,
            scorer,
            generator,
            archive,
            exporter,
            clock,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub async fn run(&self, query: SearchQuery) -> Result<WorkflowRun, WorkflowError> {
        info!(query = %query.query, max_results = query.max_results, "workflow run started");
        let mut state = BatchState::new(query);
        let mut step = WorkflowStep::Scrape;
        let mut trace = vec![step];

        while step != WorkflowStep::Terminal {
            if trace.len() > self.step_limit {
                return Err(WorkflowError::StepLimit {
                    limit: self.step_limit,
                });
            }
            let (next, next_state) = self.step(step, state).await?;
            step = next;
            state = next_state;
            trace.push(step);
        }

        info!(
            steps = trace.len(),
            saved = state.saved.len(),
            skipped = state.skipped.len(),
            "workflow run finished"
        );
        Ok(WorkflowRun { state, trace })
    }

    pub async fn step(
        &self,
        step: WorkflowStep,
        mut state: BatchState,
    ) -> Result<(WorkflowStep, BatchState), WorkflowError> {
        debug!(?step, queued = state.matches.len(), "workflow step");
        match step {
            WorkflowStep::Scrape => {
                state.jobs = self.scraper.scrape(&state.query).await?;
                info!(count = state.jobs.len(), "jobs scraped");
                Ok((WorkflowStep::Score, state))
            }
            WorkflowStep::Score => {
                let jobs = std::mem::take(&mut state.jobs);
                let outcome = self.scorer.score(jobs).await;
                let unscored = outcome.unscored();
                if unscored > 0 {
                    warn!(unscored, "jobs left unscored, exported with score 0");
                }
                state.jobs = outcome.jobs;
                state.matches = outcome.matches;
                Ok((WorkflowStep::CheckMatches, state))
            }
            WorkflowStep::CheckMatches => {
                if !state.matches.is_empty() {
                    return Ok((WorkflowStep::GenerateContent, state));
                }
                let day = self.clock.now().date_naive();
                let path = self.exporter.export(&state.jobs, day).await?;
                state.export_path = Some(path);
                Ok((WorkflowStep::Terminal, state))
            }
            WorkflowStep::GenerateContent => {
                let Some(top) = state.matches.peek().cloned() else {
                    return Ok((WorkflowStep::CheckMatches, state));
                };
                info!(job_id = %top.job_id, score = top.score, "processing matched job");
                state.current = Some(CurrentJob::new(top));
                Ok((WorkflowStep::CoverLetter, state))
            }
            WorkflowStep::CoverLetter => {
                let job = current_job(&state, step)?.clone();
                match self.generator.cover_letter(&job).await {
                    Ok(letter) => {
                        if let Some(current) = state.current.as_mut() {
                            current.cover_letter = Some(letter);
                        }
                        let next = if self.generator.is_high_value(job.score) {
                            WorkflowStep::ScrapeQuestions
                        } else {
                            WorkflowStep::InterviewScript
                        };
                        Ok((next, state))
                    }
                    Err(err) => Ok((WorkflowStep::CheckMatches, skip_current(state, &err.to_string()))),
                }
            }
            WorkflowStep::ScrapeQuestions => {
                let job = current_job(&state, step)?.clone();
                let questions = self.generator.scrape_questions(&job).await;
                let next = if questions.is_empty() {
                    WorkflowStep::InterviewScript
                } else {
                    WorkflowStep::GenerateAnswers
                };
                if let Some(current) = state.current.as_mut() {
                    current.questions = questions;
                }
                Ok((next, state))
            }
            WorkflowStep::GenerateAnswers => {
                let job = current_job(&state, step)?.clone();
                let questions = state
                    .current
                    .as_ref()
                    .map(|c| c.questions.clone())
                    .unwrap_or_default();
                let answers = self.generator.answer_questions(&job, &questions).await;
                if let Some(current) = state.current.as_mut() {
                    current.answers = answers;
                }
                Ok((WorkflowStep::InterviewScript, state))
            }
            WorkflowStep::InterviewScript => {
                let job = current_job(&state, step)?.clone();
                match self.generator.interview_script(&job).await {
                    Ok(script) => {
                        if let Some(current) = state.current.as_mut() {
                            current.interview_script = Some(script);
                        }
                        Ok((WorkflowStep::Save, state))
                    }
                    Err(err) => Ok((WorkflowStep::CheckMatches, skip_current(state, &err.to_string()))),
                }
            }
            WorkflowStep::Save => {
                let current = state
                    .current
                    .clone()
                    .ok_or(WorkflowError::NoCurrentJob { step })?;
                let generated_at = self.clock.now();
                let artifacts = ApplicationArtifacts {
                    job_id: current.job.job_id.clone(),
                    cover_letter: current.cover_letter.unwrap_or_default(),
                    interview_script: current.interview_script.unwrap_or_default(),
                    answers: current.answers,
                    generated_at,
                };
                let document = render_application_document(&current.job, &artifacts);
                let stored = self
                    .archive
                    .store_document(generated_at, &current.job.job_id, &document)
                    .await?;
                info!(
                    job_id = %current.job.job_id,
                    path = %stored.absolute_path.display(),
                    deduplicated = stored.deduplicated,
                    "application saved"
                );
                state.saved.push(stored.absolute_path);
                state.finish_current();
                Ok((WorkflowStep::CheckMatches, state))
            }
            WorkflowStep::Terminal => Ok((WorkflowStep::Terminal, state)),
        }
    }
}

fn current_job(state: &BatchState, step: WorkflowStep) -> Result<&MatchedJob, WorkflowError> {
    state
        .current
        .as_ref()
        .map(|c| &c.job)
        .ok_or(WorkflowError::NoCurrentJob { step })
}

fn skip_current(mut state: BatchState, reason: &str) -> BatchState {
    if let Some(job) = state.finish_current() {
        warn!(
            job_id = %job.job_id,
            error = %truncate_for_log(reason),
            "job skipped after generation failure"
        );
        state.skipped.push(job.job_id);
    }
    state
}

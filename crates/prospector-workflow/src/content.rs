use std::sync::Arc;

use chrono::{DateTime, Utc};
use prospector_adapters::{
    prompts, AnswersOutput, CallScriptOutput, CoverLetterOutput, ModelError, OutputSchema,
    QuestionScraper,
};
use prospector_core::{
    ensure_salutation, pair_answers, truncate_for_log, ApplicationArtifacts, ApplicationQuestion,
    MatchedJob, QuestionAnswer,
};
use prospector_storage::ResilienceError;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::ModelGateway;

/// Circuit name for apply-page fetches.
pub const APPLY_PAGE_DEPENDENCY: &str = "apply_page";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{artifact} generation failed: {source}")]
    Model {
        artifact: &'static str,
        #[source]
        source: ResilienceError<ModelError>,
    },
    #[error("{artifact} output did not decode: {source}")]
    Decode {
        artifact: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl GenerationError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GenerationError::Model { source, .. } if source.is_circuit_open())
    }
}

fn decode<T: DeserializeOwned>(artifact: &'static str, value: JsonValue) -> Result<T, GenerationError> {
    serde_json::from_value(value).map_err(|source| GenerationError::Decode { artifact, source })
}

pub struct ContentGenerator {
    gateway: ModelGateway,
    questions: Arc<dyn QuestionScraper>,
    profile: Arc<str>,
    high_value_threshold: f64,
}

impl ContentGenerator {
    pub fn new(
        gateway: ModelGateway,
        questions: Arc<dyn QuestionScraper>,
        profile: Arc<str>,
        high_value_threshold: f64,
    ) -> Self {
        Self {
            gateway,
            questions,
            profile,
            high_value_threshold,
        }
    }

    pub fn high_value_threshold(&self) -> f64 {
        self.high_value_threshold
    }

    pub fn is_high_value(&self, score: f64) -> bool {
        score >= self.high_value_threshold
    }

    pub async fn cover_letter(&self, job: &MatchedJob) -> Result<String, GenerationError> {
        let prompt = prompts::cover_letter(&self.profile, &job.prompt_text());
        let value = self
            .gateway
            .infer(&prompt, OutputSchema::CoverLetter)
            .await
            .map_err(|source| GenerationError::Model {
                artifact: "cover letter",
                source,
            })?;
        let output: CoverLetterOutput = decode("cover letter", value)?;
        debug!(job_id = %job.job_id, "cover letter generated");
        Ok(ensure_salutation(&output.letter))
    }

    pub async fn interview_script(&self, job: &MatchedJob) -> Result<String, GenerationError> {
        let prompt = prompts::call_script(&job.prompt_text());
        let value = self
            .gateway
            .infer(&prompt, OutputSchema::CallScript)
            .await
            .map_err(|source| GenerationError::Model {
                artifact: "interview script",
                source,
            })?;
        let output: CallScriptOutput = decode("interview script", value)?;
        debug!(job_id = %job.job_id, "interview script generated");
        Ok(output.script)
    }

    /// Questions on the job's apply page. Missing URL or a failed fetch
    /// yields no questions.
    pub async fn scrape_questions(&self, job: &MatchedJob) -> Vec<ApplicationQuestion> {
        let Some(apply_url) = job.apply_url.as_deref() else {
            debug!(job_id = %job.job_id, "no apply url, skipping question scrape");
            return Vec::new();
        };
        let result = self
            .gateway
            .executor()
            .call(APPLY_PAGE_DEPENDENCY, || self.questions.scrape_questions(apply_url))
            .await;
        match result {
            Ok(questions) => {
                info!(job_id = %job.job_id, count = questions.len(), "application questions scraped");
                questions
            }
            Err(err) => {
                warn!(
                    job_id = %job.job_id,
                    error = %truncate_for_log(&err.to_string()),
                    "question scrape failed, continuing without questions"
                );
                Vec::new()
            }
        }
    }

    /// Answers paired with `questions` by position. Failures are logged and
    /// yield no answers rather than failing the job.
    pub async fn answer_questions(
        &self,
        job: &MatchedJob,
        questions: &[ApplicationQuestion],
    ) -> Vec<QuestionAnswer> {
        if questions.is_empty() {
            return Vec::new();
        }
        let prompt = prompts::answer_questions(&self.profile, &job.prompt_text(), questions);
        let output = match self.gateway.infer(&prompt, OutputSchema::Answers).await {
            Ok(value) => decode::<AnswersOutput>("answers", value),
            Err(source) => Err(GenerationError::Model {
                artifact: "answers",
                source,
            }),
        };
        match output {
            Ok(output) => {
                let answers: Vec<String> = output.answers.into_iter().map(|a| a.answer).collect();
                if answers.len() != questions.len() {
                    warn!(
                        job_id = %job.job_id,
                        questions = questions.len(),
                        answers = answers.len(),
                        "answer count does not match question count"
                    );
                }
                pair_answers(questions, answers)
            }
            Err(err) => {
                warn!(
                    job_id = %job.job_id,
                    error = %truncate_for_log(&err.to_string()),
                    "answer generation failed, continuing without answers"
                );
                Vec::new()
            }
        }
    }

    /// Full generation for one job in the fixed order: cover letter, then
    /// questions and answers for high-value jobs, then the interview script.
    /// Nothing partial is returned.
    pub async fn generate(
        &self,
        job: &MatchedJob,
        generated_at: DateTime<Utc>,
    ) -> Result<ApplicationArtifacts, GenerationError> {
        let cover_letter = self.cover_letter(job).await?;
        let answers = if self.is_high_value(job.score) {
            let questions = self.scrape_questions(job).await;
            self.answer_questions(job, &questions).await
        } else {
            Vec::new()
        };
        let interview_script = self.interview_script(job).await?;

        Ok(ApplicationArtifacts {
            job_id: job.job_id.clone(),
            cover_letter,
            interview_script,
            answers,
            generated_at,
        })
    }
}

/// Markdown application document saved for each generated application.
pub fn render_application_document(job: &MatchedJob, artifacts: &ApplicationArtifacts) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("<!-- job_id: {} | score: {:.1} -->\n", job.job_id, job.score));
    doc.push_str(&format!("<!-- title: {} -->\n", job.title));
    if let Some(url) = &job.apply_url {
        doc.push_str(&format!("<!-- apply_url: {url} -->\n"));
    }
    doc.push('\n');

    doc.push_str("# Cover Letter\n\n");
    doc.push_str(artifacts.cover_letter.trim());
    doc.push_str("\n\n");

    if !artifacts.answers.is_empty() {
        doc.push_str("# Additional Questions\n\n");
        for pair in &artifacts.answers {
            doc.push_str(&format!("Q: {}\nA: {}\n\n", pair.question, pair.answer));
        }
    }

    doc.push_str("# Interview Script\n\n");
    doc.push_str(artifacts.interview_script.trim());
    doc.push('\n');
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use prospector_core::JobRecord;

    fn artifacts(answers: Vec<QuestionAnswer>) -> ApplicationArtifacts {
        ApplicationArtifacts {
            job_id: "42".into(),
            cover_letter: "Hello, I can help.".into(),
            interview_script: "# Introduction\nHi".into(),
            answers,
            generated_at: Utc::now(),
        }
    }

    fn job() -> MatchedJob {
        let mut record = JobRecord::new("Rust dev", "Build a crawler");
        record.job_id = Some("42".into());
        record.score = Some(8.0);
        MatchedJob::from_record(&record)
    }

    #[test]
    fn document_sections_are_ordered() {
        let doc = render_application_document(
            &job(),
            &artifacts(vec![QuestionAnswer {
                question: "Rate?".into(),
                answer: "$60/hr".into(),
            }]),
        );
        let letter = doc.find("# Cover Letter").expect("letter");
        let questions = doc.find("# Additional Questions").expect("questions");
        let script = doc.find("# Interview Script").expect("script");
        assert!(letter < questions && questions < script);
        assert!(doc.contains("Q: Rate?\nA: $60/hr"));
    }

    #[test]
    fn document_omits_empty_question_section() {
        let doc = render_application_document(&job(), &artifacts(vec![]));
        assert!(!doc.contains("# Additional Questions"));
        assert!(doc.starts_with("<!-- job_id: 42 | score: 8.0 -->"));
    }
}

//! Prompt builders for each model call.

use prospector_core::{ApplicationQuestion, JobRecord};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ScoringEntry<'a> {
    id: &'a str,
    title: &'a str,
    details: ScoringDetails<'a>,
}

#[derive(Debug, Serialize)]
struct ScoringDetails<'a> {
    experience_level: &'a str,
    job_type: &'a str,
    duration: &'a str,
    rate: &'a str,
    description: &'a str,
    client_information: &'a str,
}

/// `jobs` pairs each record with the id the model must echo back.
pub fn score_jobs(profile: &str, jobs: &[(String, &JobRecord)]) -> String {
    let entries: Vec<ScoringEntry<'_>> = jobs
        .iter()
        .map(|(id, job)| ScoringEntry {
            id: id.as_str(),
            title: &job.title,
            details: ScoringDetails {
                experience_level: &job.experience_level,
                job_type: job.job_type.map(|t| t.as_str()).unwrap_or(""),
                duration: &job.duration,
                rate: job.rate.as_deref().unwrap_or(""),
                description: &job.description,
                client_information: job.client_information.as_deref().unwrap_or(""),
            },
        })
        .collect();
    let jobs_json = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string());

    format!(
        "You screen freelance job listings for the freelancer described below.\n\
         Rate how well each job fits the freelancer's skills, rate expectations and \
         preferred engagement, as an integer from 1 (poor fit) to 10 (ideal fit).\n\n\
         <profile>\n{profile}\n</profile>\n\n\
         <jobs>\n{jobs_json}\n</jobs>\n\n\
         Return JSON of the form {{\"matches\": [{{\"job_id\": \"<id>\", \"score\": <1-10>}}]}} \
         with one entry per job, using the job's `id` verbatim."
    )
}

pub fn cover_letter(profile: &str, job_text: &str) -> String {
    format!(
        "Write a short, specific cover letter for the job below on behalf of the \
         freelancer described in the profile. Open with \"Hello\", reference concrete \
         details from the job, keep it under 250 words, and sign off with the \
         freelancer's name.\n\n\
         <profile>\n{profile}\n</profile>\n\n\
         <job>\n{job_text}\n</job>\n\n\
         Return JSON of the form {{\"letter\": \"...\"}}."
    )
}

pub fn call_script(job_text: &str) -> String {
    format!(
        "Prepare a discovery-call script for the job below. Use the sections \
         \"# Introduction\", \"# Key Points\", \"# Client Questions\" and \
         \"# Questions to Ask\".\n\n\
         <job>\n{job_text}\n</job>\n\n\
         Return JSON of the form {{\"script\": \"...\"}}."
    )
}

pub fn answer_questions(profile: &str, job_text: &str, questions: &[ApplicationQuestion]) -> String {
    let listed: String = questions
        .iter()
        .enumerate()
        .map(|(idx, q)| match &q.options {
            Some(options) if !options.is_empty() => {
                format!("{}. {} (options: {})\n", idx + 1, q.text, options.join(" / "))
            }
            _ => format!("{}. {}\n", idx + 1, q.text),
        })
        .collect();

    format!(
        "Answer the application questions for the job below as the freelancer \
         described in the profile. Be concise and concrete; for questions with \
         options, answer with one of the options.\n\n\
         <profile>\n{profile}\n</profile>\n\n\
         <job>\n{job_text}\n</job>\n\n\
         <questions>\n{listed}</questions>\n\n\
         Return JSON of the form {{\"answers\": [{{\"answer\": \"...\"}}]}} with one \
         answer per question, in order."
    )
}

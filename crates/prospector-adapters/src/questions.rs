use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use prospector_core::{ApplicationQuestion, QuestionKind};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::ScrapeError;

const QUESTION_BLOCKS: &str = ".application-question, fieldset[data-question]";
const QUESTION_TEXT: &str = ".question-text, legend, label";
const OPTION_ITEMS: &str = "select option, li.option";
const RADIO_INPUTS: &str = "input[type=radio]";
const FREE_TEXT_INPUTS: &str = "textarea, input[type=text]";

#[async_trait]
pub trait QuestionScraper: Send + Sync {
    /// Extra questions on a listing's apply page; an empty list is normal.
    async fn scrape_questions(&self, apply_url: &str) -> Result<Vec<ApplicationQuestion>, ScrapeError>;
}

#[derive(Debug, Clone)]
pub struct HtmlQuestionScraper {
    client: reqwest::Client,
}

impl HtmlQuestionScraper {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building question scraper http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl QuestionScraper for HtmlQuestionScraper {
    async fn scrape_questions(&self, apply_url: &str) -> Result<Vec<ApplicationQuestion>, ScrapeError> {
        let response = self.client.get(apply_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::HttpStatus {
                status: status.as_u16(),
                url: apply_url.to_string(),
            });
        }
        let html = response.text().await?;
        let questions = parse_application_questions(&html)?;
        debug!(apply_url, count = questions.len(), "parsed application questions");
        Ok(questions)
    }
}

fn selector(raw: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(raw).map_err(|e| ScrapeError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

/// Parses question blocks out of an apply page.
///
/// A block's type comes from its `data-question-type` attribute when present,
/// otherwise it is inferred: free-text inputs make it `text`, a yes/no option
/// pair makes it `yes_no`, any other options make it `multiple_choice`.
pub fn parse_application_questions(html: &str) -> Result<Vec<ApplicationQuestion>, ScrapeError> {
    let document = Html::parse_document(html);
    let blocks = selector(QUESTION_BLOCKS)?;
    let text_sel = selector(QUESTION_TEXT)?;
    let option_sel = selector(OPTION_ITEMS)?;
    let radio_sel = selector(RADIO_INPUTS)?;
    let free_text_sel = selector(FREE_TEXT_INPUTS)?;

    let mut questions = Vec::new();
    for block in document.select(&blocks) {
        let text = block
            .select(&text_sel)
            .next()
            .and_then(element_text)
            .or_else(|| block.value().attr("data-question").and_then(|v| text_or_none(v.to_string())));
        let Some(text) = text else {
            continue;
        };

        let mut options: Vec<String> = block.select(&option_sel).filter_map(element_text).collect();
        if options.is_empty() {
            options = block
                .select(&radio_sel)
                .filter_map(|input| input.value().attr("value"))
                .filter_map(|v| text_or_none(v.to_string()))
                .collect();
        }
        let has_free_text = block.select(&free_text_sel).next().is_some();

        let kind = match block.value().attr("data-question-type") {
            Some("text") => QuestionKind::Text,
            Some("yes_no") => QuestionKind::YesNo,
            Some("multiple_choice") => QuestionKind::MultipleChoice,
            _ if has_free_text || options.is_empty() => QuestionKind::Text,
            _ if is_yes_no(&options) => QuestionKind::YesNo,
            _ => QuestionKind::MultipleChoice,
        };

        questions.push(ApplicationQuestion {
            text,
            kind,
            options: match kind {
                QuestionKind::Text => None,
                _ if options.is_empty() => None,
                _ => Some(options),
            },
        });
    }
    Ok(questions)
}

fn is_yes_no(options: &[String]) -> bool {
    let mut lowered: Vec<String> = options.iter().map(|o| o.to_ascii_lowercase()).collect();
    lowered.sort();
    lowered == ["no", "yes"]
}

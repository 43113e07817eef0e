use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use prospector_adapters::{SearchQuery, DEFAULT_GEMINI_MODEL};
use prospector_core::{DEFAULT_HIGH_VALUE_THRESHOLD, MATCH_THRESHOLD};
use prospector_storage::RetryPolicy;
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_SEARCH_QUERY: &str = "AI agent Developer";
pub const DEFAULT_WEBHOOK_URL: &str = "http://localhost:5678/webhook/prospector";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub search_query: String,
    pub search_profiles_path: Option<PathBuf>,
    pub profile_path: PathBuf,
    pub poll_interval: Duration,
    pub max_jobs_per_poll: usize,
    pub job_retention_days: u32,
    pub webhook_url: String,
    pub high_value_threshold: f64,
    pub match_threshold: f64,
    pub tracking_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub applications_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    pub health_addr: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub retry_policy: RetryPolicy,
}

impl PollerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());
        let threshold = |key: &str, default: f64| {
            var(key)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(default)
        };

        let webhook_url = var("WEBHOOK_URL").unwrap_or_else(|| {
            warn!(url = DEFAULT_WEBHOOK_URL, "WEBHOOK_URL not set, using the built-in default");
            DEFAULT_WEBHOOK_URL.to_string()
        });

        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_attempts: parsed("RETRY_MAX_ATTEMPTS")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.max_attempts),
            base_delay: parsed("RETRY_BASE_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.base_delay),
            max_delay: defaults.max_delay,
        };

        Self {
            search_query: var("SEARCH_QUERY").unwrap_or_else(|| DEFAULT_SEARCH_QUERY.to_string()),
            search_profiles_path: var("SEARCH_PROFILES_PATH").map(PathBuf::from),
            profile_path: var("FREELANCER_PROFILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./files/profile.md")),
            poll_interval: Duration::from_secs(parsed("POLLING_INTERVAL").unwrap_or(480)),
            max_jobs_per_poll: parsed("MAX_JOBS_PER_POLL").map(|v| v as usize).unwrap_or(10),
            job_retention_days: parsed("JOB_RETENTION_DAYS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(30),
            webhook_url,
            high_value_threshold: threshold("HIGH_VALUE_THRESHOLD", DEFAULT_HIGH_VALUE_THRESHOLD),
            match_threshold: threshold("MATCH_THRESHOLD", MATCH_THRESHOLD),
            tracking_dir: var("TRACKING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./files/job_tracking")),
            exports_dir: var("EXPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./files/job_listings")),
            applications_dir: var("APPLICATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./files/applications")),
            fixtures_dir: var("FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            health_addr: var("HEALTH_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            gemini_api_key: var("GEMINI_API_KEY"),
            gemini_model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            retry_policy,
        }
    }

    pub fn static_query(&self) -> SearchQuery {
        SearchQuery::new(self.search_query.clone(), self.max_jobs_per_poll)
    }
}

/// Reads the freelancer profile document; it must exist and be non-empty.
pub async fn load_profile(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading freelancer profile {}", path.display()))?;
    let text = text.trim().to_string();
    if text.is_empty() {
        anyhow::bail!("freelancer profile {} is empty", path.display());
    }
    Ok(text)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchProfile {
    pub name: String,
    pub query: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_results: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SearchProfilesFile {
    #[serde(default)]
    profiles: Vec<SearchProfile>,
}

pub fn parse_search_profiles(yaml: &str) -> Result<Vec<SearchProfile>> {
    let file: SearchProfilesFile = serde_yaml::from_str(yaml).context("parsing search profiles")?;
    Ok(file.profiles)
}

pub async fn load_search_profiles(path: &Path) -> Result<Vec<SearchProfile>> {
    let yaml = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading search profiles {}", path.display()))?;
    parse_search_profiles(&yaml).with_context(|| format!("in {}", path.display()))
}

/// Round-robin over the enabled search profiles; a single static query when
/// none are configured.
#[derive(Debug, Clone)]
pub struct QueryRotation {
    queries: Vec<SearchQuery>,
    next: usize,
}

impl QueryRotation {
    pub fn single(query: SearchQuery) -> Self {
        Self {
            queries: vec![query],
            next: 0,
        }
    }

    pub fn from_profiles(profiles: &[SearchProfile], default_max_results: usize, fallback: SearchQuery) -> Self {
        let queries: Vec<SearchQuery> = profiles
            .iter()
            .filter(|p| p.enabled && !p.query.trim().is_empty())
            .map(|p| SearchQuery {
                name: p.name.clone(),
                query: p.query.clone(),
                max_results: p.max_results.unwrap_or(default_max_results),
            })
            .collect();
        if queries.is_empty() {
            warn!("no enabled search profiles, using the static query");
            return Self::single(fallback);
        }
        Self { queries, next: 0 }
    }

    pub async fn from_config(config: &PollerConfig) -> Result<Self> {
        let Some(path) = &config.search_profiles_path else {
            return Ok(Self::single(config.static_query()));
        };
        let profiles = load_search_profiles(path).await?;
        let rotation = Self::from_profiles(&profiles, config.max_jobs_per_poll, config.static_query());
        info!(profiles = rotation.len(), "search profile rotation loaded");
        Ok(rotation)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn next_query(&mut self) -> SearchQuery {
        let query = self.queries[self.next % self.queries.len()].clone();
        self.next = (self.next + 1) % self.queries.len();
        query
    }
}

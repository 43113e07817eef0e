//! Axum liveness and metrics listener for the prospector poller.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prospector_storage::{CircuitBreakerRegistry, CircuitSnapshot};
use prospector_workflow::{MetricsSnapshot, PollerConfig, PollerMetrics};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub const CRATE_NAME: &str = "prospector-web";

/// Read-only view of the configuration the poller was started with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentSnapshot {
    pub search_query: String,
    pub search_profiles: Option<String>,
    pub poll_interval_secs: u64,
    pub max_jobs_per_poll: usize,
    pub job_retention_days: u32,
    pub match_threshold: f64,
    pub high_value_threshold: f64,
    pub model: String,
    pub webhook_url: String,
}

impl EnvironmentSnapshot {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            search_query: config.search_query.clone(),
            search_profiles: config
                .search_profiles_path
                .as_ref()
                .map(|p| p.display().to_string()),
            poll_interval_secs: config.poll_interval.as_secs(),
            max_jobs_per_poll: config.max_jobs_per_poll,
            job_retention_days: config.job_retention_days,
            match_threshold: config.match_threshold,
            high_value_threshold: config.high_value_threshold,
            model: config.gemini_model.clone(),
            webhook_url: config.webhook_url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<PollerMetrics>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub environment: EnvironmentSnapshot,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        metrics: Arc<PollerMetrics>,
        breakers: Arc<CircuitBreakerRegistry>,
        environment: EnvironmentSnapshot,
    ) -> Self {
        Self {
            metrics,
            breakers,
            environment,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Uptime {
    pub seconds: i64,
    pub formatted: String,
}

impl Uptime {
    pub fn since(started_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let seconds = (now - started_at).num_seconds().max(0);
        Self {
            seconds,
            formatted: format_uptime(seconds),
        }
    }
}

/// `"Xd Yh Zm"`, seconds dropped.
pub fn format_uptime(seconds: i64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    uptime: Uptime,
    environment: EnvironmentSnapshot,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    timestamp: DateTime<Utc>,
    metrics: MetricsSnapshot,
    circuits: Vec<CircuitSnapshot>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

/// Serves until the shutdown channel flips to `true` or its sender drops.
pub async fn serve(
    addr: &str,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "health listener started");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    info!("health listener stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    Json(HealthResponse {
        status: "healthy",
        timestamp: now,
        uptime: Uptime::since(state.started_at, now),
        environment: state.environment.clone(),
    })
    .into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(MetricsResponse {
        timestamp: Utc::now(),
        metrics: state.metrics.snapshot(),
        circuits: state.breakers.snapshot(),
    })
    .into_response()
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
        .into_response()
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prospector_adapters::SearchQuery;
use prospector_storage::{CircuitBreakerRegistry, JobStore};
use prospector_web::{AppState, EnvironmentSnapshot};
use prospector_workflow::{shutdown_channel, PollerConfig, PollerMetrics, Services};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "prospector")]
#[command(about = "Freelance job prospecting: score listings, draft applications, notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll continuously until interrupted.
    Poll,
    /// One scrape-to-save workflow run.
    Run {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Apply the retention window to the job ledger.
    Cleanup {
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Ledger counts.
    Status,
    /// Health listener only.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,prospector_workflow=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = PollerConfig::from_env();

    match cli.command.unwrap_or(Commands::Poll) {
        Commands::Poll => poll(config).await?,
        Commands::Run { query, max_results } => {
            let query = SearchQuery::new(
                query.unwrap_or_else(|| config.search_query.clone()),
                max_results.unwrap_or(config.max_jobs_per_poll),
            );
            let services = Services::from_config(config).await?;
            let run = services.workflow().run(query).await?;
            println!(
                "run complete: steps={} scored={} saved={} skipped={} export={}",
                run.trace.len(),
                run.state.jobs.len(),
                run.state.saved.len(),
                run.state.skipped.len(),
                run.state
                    .export_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "n/a".into())
            );
        }
        Commands::Cleanup { retention_days } => {
            let mut store = JobStore::open(config.tracking_dir.clone())
                .await
                .with_context(|| format!("opening job ledger in {}", config.tracking_dir.display()))?;
            let report = store
                .cleanup(retention_days.unwrap_or(config.job_retention_days))
                .await?;
            println!(
                "cleanup complete: processed_removed={} seen_removed={}",
                report.processed_removed, report.seen_removed
            );
        }
        Commands::Status => {
            let store = JobStore::open(config.tracking_dir.clone())
                .await
                .with_context(|| format!("opening job ledger in {}", config.tracking_dir.display()))?;
            println!(
                "ledger {}: seen={} processed={} unprocessed={}",
                store.root().display(),
                store.seen_len(),
                store.processed_len(),
                store.get_unprocessed().len()
            );
        }
        Commands::Serve => {
            let state = AppState::new(
                Arc::new(PollerMetrics::default()),
                Arc::new(CircuitBreakerRegistry::default()),
                EnvironmentSnapshot::from_config(&config),
            );
            let (tx, rx) = shutdown_channel();
            tokio::spawn(forward_shutdown(tx));
            prospector_web::serve(&config.health_addr, state, rx).await?;
        }
    }

    Ok(())
}

async fn poll(config: PollerConfig) -> Result<()> {
    let services = Services::from_config(config).await?;
    let (tx, rx) = shutdown_channel();

    let state = AppState::new(
        Arc::clone(&services.metrics),
        Arc::clone(&services.breakers),
        EnvironmentSnapshot::from_config(&services.config),
    );
    let health_addr = services.config.health_addr.clone();
    let health_rx = rx.clone();
    let health = tokio::spawn(async move {
        if let Err(err) = prospector_web::serve(&health_addr, state, health_rx).await {
            warn!(error = %err, "health listener failed");
        }
    });

    let mut poller = services.poller(rx).await?;
    tokio::spawn(forward_shutdown(tx));

    let summary = poller.run().await;
    if let Err(err) = health.await {
        warn!(error = %err, "health listener task panicked");
    }
    println!(
        "poller stopped: cycles_completed={} cycles_failed={}",
        summary.cycles_completed, summary.cycles_failed
    );
    Ok(())
}

/// Flips the shutdown channel on Ctrl+C or SIGTERM.
async fn forward_shutdown(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested, finishing current cycle");
    let _ = tx.send(true);
}

//! CLI entry point for the futures data collector.
//!
//! Exit codes: 0 success, 1 configuration error, 2 storage error,
//! 3 exchange unreachable, 4 cancelled.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use futures_data_collector::config::AppConfig;
use futures_data_collector::error::IngestError;
use futures_data_collector::health::monitor_report;
use futures_data_collector::{
    run_collect_historical, run_health_check, run_init, run_stream_realtime, AppContext,
};

#[derive(Parser)]
#[command(
    name = "futures-data-collector",
    about = "Continuous ingestion of crypto futures market data into a time-series store",
    version
)]
struct Cli {
    /// Path to a JSON configuration file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the storage schema (idempotent).
    Init,
    /// Backfill historical data for every configured symbol.
    CollectHistorical {
        /// Days to backfill; defaults to collection.historical_days.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Stream realtime data until interrupted.
    StreamRealtime,
    /// Probe storage, cache, exchange, and data freshness.
    HealthCheck {
        /// Run a single probe (default).
        #[arg(long, conflicts_with = "continuous")]
        once: bool,
        /// Re-probe every SECS seconds until interrupted.
        #[arg(long, value_name = "SECS")]
        continuous: Option<u64>,
    },
    /// Report error counts, rates, recent records, and breaker states.
    MonitorErrors {
        /// Print a single report (default).
        #[arg(long, conflicts_with = "export")]
        once: bool,
        /// Write the full snapshot to PATH as JSON.
        #[arg(long, value_name = "PATH")]
        export: Option<PathBuf>,
    },
}

fn setup_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

/// Broadcasts true once on SIGINT/SIGTERM.
fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        let _ = tx.send(true);
    });
    rx
}

async fn run(cli: Cli) -> Result<(), IngestError> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let ctx = AppContext::initialize(config).await?;
    let shutdown = spawn_signal_listener();

    match cli.command {
        Command::Init => run_init(&ctx).await,
        Command::CollectHistorical { days } => run_collect_historical(&ctx, days, shutdown).await,
        Command::StreamRealtime => run_stream_realtime(&ctx, shutdown).await,
        Command::HealthCheck { continuous, .. } => {
            let mut shutdown = shutdown;
            loop {
                let report = run_health_check(&ctx).await;
                let rendered = serde_json::to_string_pretty(&report)
                    .unwrap_or_else(|_| "<unrenderable report>".to_string());
                println!("{rendered}");

                let Some(secs) = continuous else {
                    if !report.is_healthy() {
                        if !report.database.healthy {
                            return Err(IngestError::Storage(report.database.detail));
                        }
                        return Err(IngestError::Network(report.exchange.detail));
                    }
                    return Ok(());
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs.max(1))) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        }
        Command::MonitorErrors { export, .. } => {
            if let Some(path) = export {
                ctx.tracker.export(&path)?;
                info!(path = %path.display(), "error snapshot exported");
                return Ok(());
            }
            let report = monitor_report(&ctx.tracker, &ctx.breakers);
            let rendered = serde_json::to_string_pretty(&report)
                .unwrap_or_else(|_| "<unrenderable report>".to_string());
            println!("{rendered}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.json_logs);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            error!(kind = err.kind(), "command failed: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use series_sync::scheduler::DailySyncScheduler;
use series_sync::server::ApiServer;
use series_sync::sync::{SyncModeKind, SyncOptions, SyncRequest};
use series_sync::{AppState, SyncConfig};

#[derive(Parser)]
#[command(
    name = "series-sync",
    version,
    about = "Rate-limited time-series ingestion engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync and print its report
    Sync {
        /// full, incremental, backfill or recovery
        #[arg(long, default_value = "incremental")]
        mode: SyncModeKind,
        /// Restrict the run to these series (repeatable)
        #[arg(long = "series")]
        series: Vec<String>,
        /// Series processed concurrently within a tier
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Do not retry failed series at the end of each tier
        #[arg(long)]
        no_auto_recovery: bool,
        /// Keep observations and checkpoints in memory
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the latest run report
    Status,
    /// Print gaps and the remediation plan for one series
    Gaps {
        #[arg(long)]
        series: String,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Delete completed checkpoints past the retention window
    Prune,
    /// Run the HTTP API and the daily scheduler until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    series_sync::init_tracing(&format!(
        "series_sync={},tower_http={}",
        cli.log_level, cli.log_level
    ));

    let config = SyncConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Sync {
            mode,
            series,
            max_concurrent,
            no_auto_recovery,
            dry_run,
        } => {
            let state = if dry_run {
                AppState::dry_run(config)?
            } else {
                AppState::new(config)?
            };
            let state = Arc::new(state);
            cancel_on_ctrl_c(&state);

            let mut request = SyncRequest::new(mode).with_options(SyncOptions {
                max_concurrent,
                enable_auto_recovery: no_auto_recovery.then_some(false),
            });
            if !series.is_empty() {
                request = request.with_series(series);
            }

            let report = state.run_sync(request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            std::process::exit(report.outcome().exit_code());
        }
        Commands::Status => {
            let state = AppState::new(config)?;
            match state.latest_report().await? {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!("No sync run recorded yet"),
            }
        }
        Commands::Gaps { series, from, to } => {
            let state = AppState::new(config)?;
            let report = state.gaps(&series, from, to).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Prune => {
            let state = AppState::new(config)?;
            let removed = state.prune().await?;
            println!("Removed {} checkpoint(s)", removed);
        }
        Commands::Serve => {
            let server_config = config.server.clone();
            let schedule_config = config.schedule.clone();
            let state = Arc::new(AppState::new(config)?);

            let mut server = ApiServer::new(Arc::clone(&state));
            server.start(&server_config).await?;

            let scheduler = if schedule_config.enabled {
                Some(DailySyncScheduler::new(Arc::clone(&state), &schedule_config)?.start())
            } else {
                None
            };

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested");
            state.shutdown.cancel();
            server.stop();
            if let Some(handle) = scheduler {
                let _ = handle.await;
            }
        }
    }

    Ok(())
}

/// First Ctrl-C pauses the run at the next batch boundary
fn cancel_on_ctrl_c(state: &Arc<AppState>) {
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, cancelling sync run");
            shutdown.cancel();
        }
    });
}

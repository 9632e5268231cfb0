use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dealwatch_sync::{
    maybe_build_scheduler, orchestrator_from_config, DealLedger, ScanOrchestrator, SyncConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dealwatch")]
#[command(about = "Scan deal sources into a change-tracking ledger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan sources to completion (all enabled sources by default).
    Scan {
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Run exactly one chunk of one source.
    Chunk {
        #[arg(long)]
        source: String,
        /// Encoded cursor returned by a previous chunk.
        #[arg(long, conflicts_with = "resume")]
        cursor: Option<String>,
        /// Continue from the cursor stored in the ledger.
        #[arg(long)]
        resume: bool,
    },
    /// Apply ledger migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Scan { sources: Vec::new() }) {
        Commands::Scan { sources } => {
            let orchestrator = interruptible(orchestrator_from_config(&config).await?);
            let result = orchestrator.run_full_scan(&sources).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Chunk { source, cursor, resume } => {
            let orchestrator = interruptible(orchestrator_from_config(&config).await?);
            let result = if resume {
                orchestrator.resume_chunked_scan(&source).await?
            } else {
                orchestrator
                    .run_chunked_scan_from_token(&source, cursor.as_deref())
                    .await?
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Migrate => {
            let ledger = DealLedger::connect(&config.database_url)
                .await
                .with_context(|| format!("opening ledger at {}", config.database_url))?;
            ledger.migrate().await?;
            info!(database = %config.database_url, "migrations applied");
        }
        Commands::Schedule => {
            let orchestrator = Arc::new(orchestrator_from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, orchestrator).await? else {
                bail!("scheduler is disabled; set DEALWATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scan_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// Ctrl-c cancels in-flight retrievals; the current chunk then reports
/// itself incomplete instead of the process dying mid-write.
fn interruptible(orchestrator: ScanOrchestrator) -> ScanOrchestrator {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling scan");
            trigger.cancel();
        }
    });
    orchestrator.with_cancellation(cancel)
}

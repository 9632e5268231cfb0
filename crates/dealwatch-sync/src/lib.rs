//! Scan pipeline: deal ledger, chunked scan continuation, orchestration and
//! scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dealwatch_adapters::{adapter_for_source, SourceAdapter, SourceMode};
use dealwatch_core::AggregateResult;
use dealwatch_storage::{
    BatchFetcher, BrowserSession, Fetcher, FixtureRetriever, HttpFetcher, Retriever,
};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

pub mod config;
pub mod continuation;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;

pub use config::{SourceRegistry, SyncConfig};
pub use continuation::{ChunkRunner, ChunkSettings};
pub use ledger::{DealLedger, LedgerError, ReconcileAction, ReconcileOutcome};
pub use orchestrator::{OrchestratorError, ScanOrchestrator};
pub use progress::ProgressChannel;

pub const CRATE_NAME: &str = "dealwatch-sync";

/// Opens and migrates the ledger, loads the source registry and registers
/// every enabled source. Live sources share one [`Fetcher`] whose rendering
/// environment launches on first use and is shut down by its last user.
pub async fn orchestrator_from_config(config: &SyncConfig) -> Result<ScanOrchestrator> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let ledger = DealLedger::connect(&config.database_url)
        .await
        .with_context(|| format!("opening ledger at {}", config.database_url))?;
    ledger.migrate().await.context("applying ledger migrations")?;

    let mut orchestrator = ScanOrchestrator::new(ledger)
        .with_settings(config.chunk_settings())
        .with_detail_fetcher(BatchFetcher::new(Duration::from_secs(config.http_timeout_secs)));

    let mut live: Option<Arc<dyn Retriever>> = None;
    for source in registry.enabled() {
        let adapter = adapter_for_source(source)
            .with_context(|| format!("configuring source {}", source.source_id))?;
        let adapter: Arc<dyn SourceAdapter> = Arc::from(adapter);
        let retriever: Arc<dyn Retriever> = match source.mode {
            SourceMode::Fixture => {
                let manifest = config.fixture_manifest_for(source);
                Arc::new(FixtureRetriever::from_manifest(&manifest)?)
            }
            SourceMode::Live => match &live {
                Some(shared) => shared.clone(),
                None => {
                    let shared = live_fetcher(config)?;
                    live = Some(shared.clone());
                    shared
                }
            },
        };
        info!(
            source = %source.source_id,
            mode = ?source.mode,
            variant = ?adapter.variant(),
            "source registered"
        );
        orchestrator = orchestrator.register(adapter, retriever);
    }
    Ok(orchestrator)
}

fn live_fetcher(config: &SyncConfig) -> Result<Arc<dyn Retriever>> {
    let http = HttpFetcher::new(config.http_config())?;
    let fetcher = Fetcher::new(
        http,
        Duration::from_secs(config.http_timeout_secs),
        Duration::from_secs(config.page_timeout_secs),
    )
    .with_renderer(Arc::new(BrowserSession::new(config.render_settings())));
    Ok(Arc::new(fetcher))
}

pub async fn run_full_scan_from_env(sources: &[String]) -> Result<AggregateResult> {
    let config = SyncConfig::from_env();
    let orchestrator = orchestrator_from_config(&config).await?;
    Ok(orchestrator.run_full_scan(sources).await?)
}

/// The cron job is only built when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<ScanOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let sources = orchestrator.source_ids();
    let sched = scheduler::build_scheduler(orchestrator, &config.scan_cron, sources).await?;
    Ok(Some(sched))
}

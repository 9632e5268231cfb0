use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dealwatch_adapters::SourceAdapter;
use dealwatch_core::{
    AggregateResult, ScanChunkResult, ScanCursor, ScanError, ScanErrorKind, ScanEvent,
    SourceScanSummary,
};
use dealwatch_storage::{BatchFetcher, Retriever};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::continuation::{ChunkRunner, ChunkSettings};
use crate::ledger::{DealLedger, LedgerError};
use crate::progress::ProgressChannel;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("a chunk of `{0}` is already in flight")]
    AlreadyRunning(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

struct SourceHandle {
    adapter: Arc<dyn SourceAdapter>,
    retriever: Arc<dyn Retriever>,
}

/// Drives registered sources through the chunk protocol.
///
/// Sources run one after another. At most one chunk per source is in flight
/// at any time; a second concurrent request for the same source is refused.
pub struct ScanOrchestrator {
    ledger: DealLedger,
    sources: BTreeMap<String, SourceHandle>,
    progress: ProgressChannel,
    settings: ChunkSettings,
    details: BatchFetcher,
    in_flight: Mutex<HashSet<String>>,
    users: RetrieverUsers,
    cancel: CancellationToken,
}

impl ScanOrchestrator {
    pub fn new(ledger: DealLedger) -> Self {
        Self {
            ledger,
            sources: BTreeMap::new(),
            progress: ProgressChannel::default(),
            settings: ChunkSettings::default(),
            details: BatchFetcher::new(Duration::from_secs(20)),
            in_flight: Mutex::new(HashSet::new()),
            users: RetrieverUsers::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a source under its adapter's site name. Sources may share a
    /// retriever; it is released once no entry point is using it.
    pub fn register(
        mut self,
        adapter: Arc<dyn SourceAdapter>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        self.sources
            .insert(adapter.source_site().to_string(), SourceHandle { adapter, retriever });
        self
    }

    pub fn with_settings(mut self, settings: ChunkSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_detail_fetcher(mut self, details: BatchFetcher) -> Self {
        self.details = details;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    pub fn ledger(&self) -> &DealLedger {
        &self.ledger
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Scans each named source (all registered sources when `sources` is
    /// empty) chunk by chunk until it completes or stops making progress.
    pub async fn run_full_scan(
        &self,
        sources: &[String],
    ) -> Result<AggregateResult, OrchestratorError> {
        let ids = if sources.is_empty() {
            self.source_ids()
        } else {
            sources.to_vec()
        };
        let handles = ids
            .iter()
            .map(|id| self.handle(id).map(|handle| (id.as_str(), handle)))
            .collect::<Result<Vec<_>, _>>()?;

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = ids.len(), "full scan started");

        let mut leases = Vec::with_capacity(handles.len());
        for (_, handle) in &handles {
            leases.push(self.users.enter(&handle.retriever).await);
        }

        let mut summaries = Vec::with_capacity(handles.len());
        let mut outcome = Ok(());
        for (id, handle) in &handles {
            let _slot = match InFlight::acquire(&self.in_flight, id) {
                Ok(slot) => slot,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            summaries.push(self.drive_source(id, handle).await);
            if self.cancel.is_cancelled() {
                warn!(%run_id, "full scan cancelled");
                break;
            }
        }

        for lease in leases {
            lease.finish().await;
        }
        outcome?;

        let result = AggregateResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: summaries,
        };
        info!(
            %run_id,
            processed = result.total_processed(),
            errors = result.total_errors(),
            "full scan finished"
        );
        Ok(result)
    }

    /// Runs exactly one chunk of `source` starting at `cursor`.
    pub async fn run_chunked_scan(
        &self,
        source: &str,
        cursor: Option<ScanCursor>,
    ) -> Result<ScanChunkResult, OrchestratorError> {
        let handle = self.handle(source)?;
        let _slot = InFlight::acquire(&self.in_flight, source)?;
        let lease = self.users.enter(&handle.retriever).await;
        let result = self.chunk(handle, cursor).await;
        lease.finish().await;
        Ok(result)
    }

    /// Like [`Self::run_chunked_scan`], taking the cursor in its encoded form.
    /// An undecodable token restarts the source with an `InvalidCursor` error.
    pub async fn run_chunked_scan_from_token(
        &self,
        source: &str,
        token: Option<&str>,
    ) -> Result<ScanChunkResult, OrchestratorError> {
        let (cursor, rejected) = match token.map(ScanCursor::decode).transpose() {
            Ok(cursor) => (cursor, None),
            Err(err) => (None, Some(invalid_cursor(source, err.to_string()))),
        };
        let mut result = self.run_chunked_scan(source, cursor).await?;
        if let Some(error) = rejected {
            warn!(source, "undecodable cursor token; restarted from the beginning");
            result.errors.insert(0, error);
        }
        Ok(result)
    }

    /// Runs one chunk from the cursor persisted for `source` and persists the
    /// cursor it returns; a finished sequence clears it.
    pub async fn resume_chunked_scan(
        &self,
        source: &str,
    ) -> Result<ScanChunkResult, OrchestratorError> {
        let handle = self.handle(source)?;
        let _slot = InFlight::acquire(&self.in_flight, source)?;

        let (cursor, rejected) = match self.ledger.load_cursor(source).await {
            Ok(cursor) => (cursor, None),
            Err(LedgerError::Cursor(err)) => (None, Some(invalid_cursor(source, err.to_string()))),
            Err(err) => return Err(err.into()),
        };

        let lease = self.users.enter(&handle.retriever).await;
        let mut result = self.chunk(handle, cursor).await;
        lease.finish().await;
        if let Some(error) = rejected {
            result.errors.insert(0, error);
        }

        match &result.next_cursor {
            Some(next) => self.ledger.save_cursor(next).await?,
            None => self.ledger.clear_cursor(source).await?,
        }
        Ok(result)
    }

    fn handle(&self, source: &str) -> Result<&SourceHandle, OrchestratorError> {
        self.sources
            .get(source)
            .ok_or_else(|| OrchestratorError::UnknownSource(source.to_string()))
    }

    async fn drive_source(&self, id: &str, handle: &SourceHandle) -> SourceScanSummary {
        let mut summary = SourceScanSummary::new(id);
        let mut cursor: Option<ScanCursor> = None;
        loop {
            let chunk = self.chunk(handle, cursor.clone()).await;
            summary.absorb(&chunk);
            match &chunk.next_cursor {
                None => break,
                Some(next) if Some(next) == cursor.as_ref() => {
                    let offset = next.offset;
                    warn!(source = id, offset, "chunk made no progress; stopping source");
                    break;
                }
                Some(_) if self.cancel.is_cancelled() => break,
                Some(next) => cursor = Some(next.clone()),
            }
        }
        info!(
            source = id,
            chunks = summary.chunks,
            processed = summary.processed,
            expired = summary.expired,
            completed = summary.completed,
            "source scan finished"
        );
        summary
    }

    async fn chunk(&self, handle: &SourceHandle, cursor: Option<ScanCursor>) -> ScanChunkResult {
        let runner = ChunkRunner {
            adapter: handle.adapter.as_ref(),
            retriever: handle.retriever.as_ref(),
            ledger: &self.ledger,
            progress: &self.progress,
            details: &self.details,
            settings: self.settings,
        };
        let result = runner.run(cursor, &self.cancel).await;
        if let Err(err) = self.ledger.record_chunk(&result).await {
            warn!(source = %result.source, error = %err, "failed to record chunk result");
        }
        result
    }
}

/// Marks a source busy until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    source: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, source: &str) -> Result<Self, OrchestratorError> {
        let mut busy = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(source.to_string()) {
            return Err(OrchestratorError::AlreadyRunning(source.to_string()));
        }
        Ok(Self {
            set,
            source: source.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.source);
    }
}

/// Counts the entry points using each retriever. Several sources may share
/// one live retriever (and its rendering environment); only the last user to
/// finish releases it.
#[derive(Default)]
struct RetrieverUsers {
    counts: Mutex<HashMap<usize, usize>>,
    // Held across `release` so nobody starts using a retriever mid-teardown.
    releasing: tokio::sync::Mutex<()>,
}

impl RetrieverUsers {
    async fn enter(&self, retriever: &Arc<dyn Retriever>) -> RetrieverLease<'_> {
        let _gate = self.releasing.lock().await;
        let key = retriever_key(retriever);
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(0) += 1;
        RetrieverLease {
            users: self,
            key,
            retriever: retriever.clone(),
            finished: false,
        }
    }

    /// Drops one use of `key`; true when it was the last.
    fn leave(&self, key: usize) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                counts.remove(&key);
                true
            }
        }
    }
}

fn invalid_cursor(source: &str, message: String) -> ScanError {
    ScanError::new(ScanErrorKind::InvalidCursor, message).with_reference(source)
}

fn retriever_key(retriever: &Arc<dyn Retriever>) -> usize {
    Arc::as_ptr(retriever) as *const () as usize
}

struct RetrieverLease<'a> {
    users: &'a RetrieverUsers,
    key: usize,
    retriever: Arc<dyn Retriever>,
    finished: bool,
}

impl RetrieverLease<'_> {
    async fn finish(mut self) {
        let _gate = self.users.releasing.lock().await;
        self.finished = true;
        if self.users.leave(self.key) {
            self.retriever.release().await;
        } else {
            debug!("retriever still in use by another scan; release deferred");
        }
    }
}

impl Drop for RetrieverLease<'_> {
    fn drop(&mut self) {
        // An abandoned scan gives up its use without tearing anything down.
        if !self.finished {
            self.users.leave(self.key);
        }
    }
}

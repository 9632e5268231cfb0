//! One bounded chunk of a source scan.
//!
//! A chunk asks the adapter for at most `limit` candidates, reconciles them
//! and hands back the cursor for the next chunk. The whole chunk races a
//! wall-clock guard; when the guard wins, every in-flight retrieval is
//! cancelled and the chunk reports itself incomplete with its input cursor,
//! so rerunning it repeats (idempotent) work instead of skipping any.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use dealwatch_adapters::{AdapterContext, SourceAdapter};
use dealwatch_core::{ScanChunkResult, ScanCursor, ScanError, ScanErrorKind, ScanEvent, ScanPhase};
use dealwatch_storage::{BatchFetcher, Retriever};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ledger::{DealLedger, ReconcileAction};
use crate::progress::ProgressChannel;

pub const DEFAULT_CHUNK_LIMIT: usize = 40;
pub const DEFAULT_CHUNK_BUDGET: Duration = Duration::from_secs(50);

/// How long a chunk whose guard fired may take to unwind.
pub const GUARD_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Maximum candidates requested from the adapter per chunk.
    pub limit: usize,
    /// Wall-clock guard; keep it below the host's own invocation limit.
    pub budget: Duration,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_CHUNK_LIMIT,
            budget: DEFAULT_CHUNK_BUDGET,
        }
    }
}

pub struct ChunkRunner<'a> {
    pub adapter: &'a dyn SourceAdapter,
    pub retriever: &'a dyn Retriever,
    pub ledger: &'a DealLedger,
    pub progress: &'a ProgressChannel,
    pub details: &'a BatchFetcher,
    pub settings: ChunkSettings,
}

impl ChunkRunner<'_> {
    pub async fn run(
        &self,
        cursor: Option<ScanCursor>,
        cancel: &CancellationToken,
    ) -> ScanChunkResult {
        let site = self.adapter.source_site().to_string();
        let mut result = ScanChunkResult::empty(&site, Utc::now());

        let cursor = match cursor {
            Some(cursor) if cursor.source != site => {
                warn!(
                    site = %site,
                    cursor_source = %cursor.source,
                    "cursor belongs to another source; restarting"
                );
                result.errors.push(
                    ScanError::new(
                        ScanErrorKind::InvalidCursor,
                        format!("cursor for `{}` cannot resume `{site}`", cursor.source),
                    )
                    .with_reference(cursor.source),
                );
                None
            }
            other => other,
        };
        let input_cursor = cursor.clone();

        let guard = cancel.child_token();
        let timed_out = {
            let work = self.work(cursor, &guard, &mut result);
            tokio::pin!(work);
            let timed_out = tokio::select! {
                biased;
                _ = &mut work => false,
                _ = tokio::time::sleep(self.settings.budget) => true,
            };
            if timed_out {
                // In-flight retrievals observe the token and unwind; work that
                // ignores it is abandoned after the grace period.
                guard.cancel();
                if tokio::time::timeout(GUARD_GRACE, &mut work).await.is_err() {
                    warn!(site = %site, "chunk did not stop after cancellation; abandoned");
                }
            }
            timed_out
        };

        if timed_out {
            warn!(
                site = %site,
                budget = ?self.settings.budget,
                processed = result.processed,
                "chunk guard fired"
            );
            result.errors.push(ScanError::new(
                ScanErrorKind::ChunkTimeoutGuard,
                format!("chunk exceeded its {:?} budget", self.settings.budget),
            ));
            result.is_complete = false;
            result.swept = false;
            result.next_cursor = input_cursor;
            let message = "chunk interrupted by the wall-clock guard";
            self.progress.emit(ScanEvent::new(&site, ScanPhase::Error, message));
        }

        result.finished_at = Utc::now();
        result
    }

    async fn work(
        &self,
        cursor: Option<ScanCursor>,
        guard: &CancellationToken,
        result: &mut ScanChunkResult,
    ) {
        let site = result.source.clone();
        let resumed_at = cursor.as_ref().map_or(0, |c| c.offset);
        self.progress.emit(ScanEvent::new(
            &site,
            ScanPhase::Connecting,
            format!("scanning {site} from offset {resumed_at}"),
        ));

        let sink = |event: ScanEvent| self.progress.emit(event);
        let ctx = AdapterContext::new(self.retriever, guard.clone(), self.details.clone())
            .with_events(&sink);

        let batch = match self
            .adapter
            .list_candidates(&ctx, self.settings.limit, cursor.as_ref())
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                let error = err.to_scan_error();
                warn!(site = %site, error = %error, "listing failed; chunk left incomplete");
                self.progress.emit(ScanEvent::new(&site, ScanPhase::Error, error.to_string()));
                result.errors.push(error);
                result.next_cursor = cursor;
                return;
            }
        };
        result.errors.extend(batch.errors);
        result.yielded_candidates = !batch.candidates.is_empty();

        // The observed set and degraded flag accumulate across the whole sequence.
        let mut observed: BTreeSet<String> =
            cursor.as_ref().map(|c| c.observed.clone()).unwrap_or_default();
        observed.extend(batch.candidates.iter().map(|c| c.source_url.clone()));
        let degraded = cursor.as_ref().is_some_and(|c| c.degraded) || batch.degraded;
        let next_cursor = batch.next_cursor.map(|mut next| {
            next.observed = observed.clone();
            next.degraded = degraded;
            next
        });

        let total = batch.candidates.len();
        for (index, candidate) in batch.candidates.iter().enumerate() {
            if guard.is_cancelled() {
                result.errors.push(ScanError::new(
                    ScanErrorKind::Cancelled,
                    "scan cancelled before all candidates were saved",
                ));
                let message = "cancelled while persisting";
                self.progress.emit(ScanEvent::new(&site, ScanPhase::Error, message));
                result.next_cursor = cursor;
                return;
            }
            match self.ledger.reconcile_one(candidate, Utc::now()).await {
                Ok((action, _reactivated)) => {
                    match action {
                        ReconcileAction::Created => result.created += 1,
                        ReconcileAction::Updated => result.updated += 1,
                        ReconcileAction::Refreshed => {}
                    }
                    if action.snapshotted() {
                        result.snapshotted += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        site = %site,
                        url = %candidate.source_url,
                        error = %err,
                        "reconcile failed"
                    );
                    result.errors.push(
                        ScanError::new(ScanErrorKind::Persistence, err.to_string())
                            .with_reference(candidate.source_url.clone()),
                    );
                }
            }
            result.processed += 1;
            self.progress.emit(
                ScanEvent::new(&site, ScanPhase::Persisting, "reconciling candidates")
                    .with_progress(index + 1, total),
            );
        }

        if guard.is_cancelled() {
            // Never sweep on the strength of a cancelled enumeration.
            result.errors.push(ScanError::new(
                ScanErrorKind::Cancelled,
                "scan cancelled before the sequence was closed",
            ));
            result.next_cursor = cursor;
            return;
        }
        if next_cursor.is_none() {
            self.finish_sequence(&site, &observed, degraded, result).await;
        }
        result.next_cursor = next_cursor;
        result.is_complete = true;

        self.progress.emit(ScanEvent::new(
            &site,
            ScanPhase::Complete,
            format!(
                "processed {} (created {}, updated {}, expired {}){}",
                result.processed,
                result.created,
                result.updated,
                result.expired,
                if result.next_cursor.is_some() { "; more to scan" } else { "" }
            ),
        ));
    }

    /// Expiry runs only after a full, clean enumeration that observed something.
    async fn finish_sequence(
        &self,
        site: &str,
        observed: &BTreeSet<String>,
        degraded: bool,
        result: &mut ScanChunkResult,
    ) {
        if observed.is_empty() {
            warn!(site, "scan enumerated no candidates; sweep suppressed");
            result.errors.push(ScanError::new(
                ScanErrorKind::AdapterExhaustion,
                "source yielded no candidates; expiry sweep suppressed",
            ));
            return;
        }
        if degraded {
            warn!(site, "part of the listing was skipped; sweep suppressed");
            result.errors.push(ScanError::new(
                ScanErrorKind::SweepSkipped,
                "listing was only partially enumerated; expiry sweep skipped",
            ));
            return;
        }
        match self.ledger.sweep_expired(site, observed).await {
            Ok(expired) => {
                result.expired = expired;
                result.swept = true;
                info!(site, expired, "scan sequence complete");
            }
            Err(err) => {
                warn!(site, error = %err, "expiry sweep failed");
                result.errors.push(ScanError::new(ScanErrorKind::Persistence, err.to_string()));
            }
        }
    }
}

//! Core deal model, scan cursor and scan event types for dealwatch.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-core";

/// Freshly scraped offer, prior to reconciliation. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDeal {
    pub source_site: String,
    /// Stable identity of the offer within its source.
    pub source_url: String,
    pub merchant_name: String,
    pub title: String,
    pub original_price: Option<f64>,
    pub offer_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub units_sold: Option<u64>,
    pub image_url: Option<String>,
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CandidateDeal {
    pub fn metrics(&self) -> DealMetrics {
        DealMetrics {
            original_price: self.original_price,
            offer_price: self.offer_price,
            discount_percent: self.discount_percent,
            units_sold: self.units_sold,
        }
    }
}

/// The tracked fields whose change appends a [`DealSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DealMetrics {
    pub original_price: Option<f64>,
    pub offer_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub units_sold: Option<u64>,
}

impl DealMetrics {
    /// Fills every metric this observation lacks from `stored`.
    pub fn or_stored(self, stored: &DealMetrics) -> DealMetrics {
        DealMetrics {
            original_price: self.original_price.or(stored.original_price),
            offer_price: self.offer_price.or(stored.offer_price),
            discount_percent: self.discount_percent.or(stored.discount_percent),
            units_sold: self.units_sold.or(stored.units_sold),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Active,
    Expired,
}

impl DealStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DealStatus::Active => "active",
            DealStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown deal status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for DealStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DealStatus::Active),
            "expired" => Ok(DealStatus::Expired),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Persisted, deduplicated deal identified by `(source_site, source_url)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: Uuid,
    pub source_site: String,
    pub source_url: String,
    pub merchant_name: String,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub badge: Option<String>,
    pub original_price: Option<f64>,
    pub offer_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub units_sold: Option<u64>,
    pub status: DealStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_scanned_at: DateTime<Utc>,
    /// Set only on the active -> expired transition.
    pub expires_at: Option<DateTime<Utc>>,
}

impl DealRecord {
    pub fn metrics(&self) -> DealMetrics {
        DealMetrics {
            original_price: self.original_price,
            offer_price: self.offer_price,
            discount_percent: self.discount_percent,
            units_sold: self.units_sold,
        }
    }
}

/// Append-only, point-in-time copy of a record's tracked metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealSnapshot {
    pub id: Uuid,
    pub deal_id: Uuid,
    pub original_price: Option<f64>,
    pub offer_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub units_sold: Option<u64>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Resumption marker for a chunked source scan.
///
/// Besides the offset, a cursor carries everything the final chunk of a scan
/// sequence needs to decide on a sweep: when the sequence started, which
/// identities it has observed so far and whether any listing retrieval failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub source: String,
    pub offset: usize,
    /// Ordered listing snapshot for sources whose listing is expensive to rebuild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<Vec<CandidateDeal>>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub observed: BTreeSet<String>,
    #[serde(default)]
    pub degraded: bool,
    /// Upstream page the next chunk reads, for paginated sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PagePosition>,
}

/// Position inside a paginated upstream listing. Upstream pages may hold
/// fewer items than requested, so the page number is tracked on its own
/// rather than derived from the item offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePosition {
    /// 1-based page number.
    pub page: usize,
    /// Items of `page` already consumed.
    pub skip: usize,
}

impl PagePosition {
    pub fn first() -> Self {
        Self { page: 1, skip: 0 }
    }

    pub fn next_page(self) -> Self {
        Self {
            page: self.page + 1,
            skip: 0,
        }
    }
}

impl ScanCursor {
    pub fn start(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            offset: 0,
            listing: None,
            started_at: Utc::now(),
            observed: BTreeSet::new(),
            degraded: false,
            page: None,
        }
    }

    /// Copy of this cursor moved forward by `consumed` upstream items.
    pub fn advanced(&self, consumed: usize) -> Self {
        let mut next = self.clone();
        next.offset += consumed;
        next
    }

    pub fn at_page(mut self, position: PagePosition) -> Self {
        self.page = Some(position);
        self
    }

    pub fn with_listing(mut self, listing: Vec<CandidateDeal>) -> Self {
        self.listing = Some(listing);
        self
    }

    pub fn encode(&self) -> Result<String, CursorError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(token: &str) -> Result<Self, CursorError> {
        Ok(serde_json::from_str(token)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    Network,
    Timeout,
    HttpStatus,
    Cancelled,
    Parse,
    AdapterExhaustion,
    ChunkTimeoutGuard,
    InvalidCursor,
    Persistence,
    SweepSkipped,
}

/// Soft error accumulated into a chunk's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub kind: ScanErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl ScanError {
    pub fn new(kind: ScanErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Some(reference) => write!(f, "{:?}: {} ({reference})", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Outcome of one bounded unit of scan work for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanChunkResult {
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub snapshotted: usize,
    pub expired: usize,
    /// The adapter produced at least one candidate during this chunk.
    pub yielded_candidates: bool,
    /// The chunk's work ran to the end; false after a guard timeout,
    /// cancellation or a listing failure.
    pub is_complete: bool,
    pub swept: bool,
    pub next_cursor: Option<ScanCursor>,
    pub errors: Vec<ScanError>,
}

impl ScanChunkResult {
    pub fn empty(source: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            started_at,
            finished_at: started_at,
            processed: 0,
            created: 0,
            updated: 0,
            snapshotted: 0,
            expired: 0,
            yielded_candidates: false,
            is_complete: false,
            swept: false,
            next_cursor: None,
            errors: Vec::new(),
        }
    }

    /// The chunk ran to the end and the source has nothing left to enumerate.
    pub fn finished_sequence(&self) -> bool {
        self.is_complete && self.next_cursor.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceScanSummary {
    pub source: String,
    pub chunks: usize,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub snapshotted: usize,
    pub expired: usize,
    pub completed: bool,
    pub swept: bool,
    pub errors: Vec<ScanError>,
}

impl SourceScanSummary {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn absorb(&mut self, chunk: &ScanChunkResult) {
        self.chunks += 1;
        self.processed += chunk.processed;
        self.created += chunk.created;
        self.updated += chunk.updated;
        self.snapshotted += chunk.snapshotted;
        self.expired += chunk.expired;
        self.completed = chunk.finished_sequence();
        self.swept |= chunk.swept;
        self.errors.extend(chunk.errors.iter().cloned());
    }
}

/// Result of driving one or more sources to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceScanSummary>,
}

impl AggregateResult {
    pub fn total_processed(&self) -> usize {
        self.sources.iter().map(|s| s.processed).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.sources.iter().map(|s| s.errors.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Connecting,
    Listing,
    FetchingDetail,
    Persisting,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

/// One entry of the progress stream published while a source is scanned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub source: String,
    pub phase: ScanPhase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub at: DateTime<Utc>,
}

impl ScanEvent {
    pub fn new(source: impl Into<String>, phase: ScanPhase, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            phase,
            message: message.into(),
            progress: None,
            at: Utc::now(),
        }
    }

    pub fn with_progress(mut self, current: usize, total: usize) -> Self {
        self.progress = Some(Progress { current, total });
        self
    }
}

//! Source adapter contract and the per-site adapter implementations.
//!
//! Adapters only enumerate and extract; reconciliation, expiry and cursor
//! persistence live in `dealwatch-sync`.

use async_trait::async_trait;
use dealwatch_core::{CandidateDeal, ScanCursor, ScanError, ScanEvent};
use dealwatch_storage::{BatchFetcher, FetchError, Retriever};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod extract;
pub mod listing;
pub mod profiles;
mod rendered;
mod structured;
pub mod text;
pub mod title;

pub use rendered::RenderedAdapter;
pub use structured::{StructuredListAdapter, DEFAULT_PAGE_SIZE};

pub const CRATE_NAME: &str = "dealwatch-adapters";

/// Retrieval shape of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterVariant {
    /// Paginated structured listing; the cursor is an item offset.
    StructuredList,
    /// Rendered listing; the first chunk snapshots it into the cursor.
    RenderedList,
    /// Rendered listing plus one detail retrieval per candidate.
    RenderedListWithDetail,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("listing retrieval failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn to_scan_error(&self) -> ScanError {
        match self {
            AdapterError::Fetch(err) => err.to_scan_error(),
            AdapterError::Message(message) => {
                ScanError::new(dealwatch_core::ScanErrorKind::Parse, message.clone())
            }
        }
    }
}

/// What one `list_candidates` call produced.
#[derive(Debug, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<CandidateDeal>,
    /// `None` once the source has nothing further to enumerate.
    pub next_cursor: Option<ScanCursor>,
    pub errors: Vec<ScanError>,
    /// Part of the enumeration was skipped; the sequence must not drive a sweep.
    pub degraded: bool,
}

type EventSink<'a> = &'a (dyn Fn(ScanEvent) + Send + Sync);

/// Everything an adapter may use while enumerating one chunk.
pub struct AdapterContext<'a> {
    pub retriever: &'a dyn Retriever,
    pub cancel: CancellationToken,
    pub details: BatchFetcher,
    events: Option<EventSink<'a>>,
}

impl<'a> AdapterContext<'a> {
    pub fn new(
        retriever: &'a dyn Retriever,
        cancel: CancellationToken,
        details: BatchFetcher,
    ) -> Self {
        Self {
            retriever,
            cancel,
            details,
            events: None,
        }
    }

    pub fn with_events(mut self, sink: EventSink<'a>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn emit(&self, event: ScanEvent) {
        if let Some(sink) = self.events {
            sink(event);
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_site(&self) -> &str;
    fn variant(&self) -> AdapterVariant;

    /// Enumerates up to `limit` candidates starting at `cursor`.
    ///
    /// An `Err` means nothing could be enumerated at all; partial trouble is
    /// reported through [`CandidateBatch::errors`].
    async fn list_candidates(
        &self,
        ctx: &AdapterContext<'_>,
        limit: usize,
        cursor: Option<&ScanCursor>,
    ) -> Result<CandidateBatch, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    /// Replay captured pages from `fixture_manifest` instead of the network.
    Fixture,
}

/// One entry of the source registry (`sources.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Extraction profile; defaults to `source_id`.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub mode: SourceMode,
    /// Listing page, or API endpoint for structured sources.
    pub listing_url: String,
    /// Pre-filter applied to the listing request (e.g. a category).
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub fixture_manifest: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn profile_name(&self) -> &str {
        self.profile.as_deref().unwrap_or(&self.source_id)
    }
}

pub const KNOWN_PROFILES: &[&str] = &["citydeals", "snapbuy", "localfeast"];

pub fn adapter_for_source(config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let site = config.source_id.as_str();
    let filter = config.filter.as_deref();
    match config.profile_name() {
        "citydeals" => {
            if filter.is_some() {
                return Err(AdapterError::Message(format!(
                    "{site}: structured listing takes no filter"
                )));
            }
            Ok(Box::new(StructuredListAdapter::new(
                site,
                &config.listing_url,
                config.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                profiles::CITYDEALS,
            )?))
        }
        "snapbuy" => Ok(Box::new(RenderedAdapter::new(
            site,
            &config.listing_url,
            filter,
            profiles::SNAPBUY,
            None,
        )?)),
        "localfeast" => Ok(Box::new(RenderedAdapter::new(
            site,
            &config.listing_url,
            filter,
            profiles::LOCALFEAST,
            Some(profiles::LOCALFEAST_DETAIL),
        )?)),
        other => Err(AdapterError::Message(format!(
            "{site}: unknown profile `{other}` (known: {})",
            KNOWN_PROFILES.join(", ")
        ))),
    }
}

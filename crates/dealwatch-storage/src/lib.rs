//! Resource retrieval for dealwatch: plain HTTP, rendered pages, bounded
//! detail batches and fixture replay, all behind the [`Retriever`] seam.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealwatch_core::{ScanError, ScanErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod batch;
mod fixture;
mod http;
mod render;

pub use batch::{BatchFetcher, BatchOutcome, DETAIL_CONCURRENCY, INTER_BATCH_DELAY};
pub use fixture::FixtureRetriever;
pub use http::{classify_status, HttpClientConfig, HttpFetcher};
pub use render::{BrowserSession, PageRenderer, RenderSettings, ScrollTracker};

pub const CRATE_NAME: &str = "dealwatch-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Single request/response.
    Plain,
    /// Script-executing environment, scrolled until the document settles.
    Rendered,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub url: String,
    pub mode: FetchMode,
}

impl ResourceRef {
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: FetchMode::Plain,
        }
    }

    pub fn rendered(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: FetchMode::Rendered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out after {after:?} retrieving {url}")]
    Timeout { url: String, after: Duration },
    #[error("network error retrieving {url}: {message}")]
    Network { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("retrieval of {url} was cancelled")]
    Cancelled { url: String },
    #[error("rendering {url} failed: {message}")]
    Render { url: String, message: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Timeout { url, .. }
            | FetchError::Network { url, .. }
            | FetchError::HttpStatus { url, .. }
            | FetchError::Cancelled { url }
            | FetchError::Render { url, .. } => url,
        }
    }

    pub fn kind(&self) -> ScanErrorKind {
        match self {
            FetchError::Timeout { .. } => ScanErrorKind::Timeout,
            FetchError::Network { .. } | FetchError::Render { .. } => ScanErrorKind::Network,
            FetchError::HttpStatus { .. } => ScanErrorKind::HttpStatus,
            FetchError::Cancelled { .. } => ScanErrorKind::Cancelled,
        }
    }

    pub fn to_scan_error(&self) -> ScanError {
        ScanError::new(self.kind(), self.to_string()).with_reference(self.url())
    }
}

/// Anything that can turn a [`ResourceRef`] into a document.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        resource: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage, FetchError>;

    /// Tear down any long-lived resources held for this invocation.
    async fn release(&self) {}
}

/// Runs `fut` under its own deadline and the caller's cancellation token.
pub async fn with_deadline<T, F>(
    url: &str,
    deadline: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled { url: url.to_string() }),
        outcome = tokio::time::timeout(deadline, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout { url: url.to_string(), after: deadline }),
        },
    }
}

/// Production retriever: plain requests through [`HttpFetcher`], rendered
/// pages through an owned [`PageRenderer`].
pub struct Fetcher {
    http: HttpFetcher,
    renderer: Option<Arc<dyn PageRenderer>>,
    request_timeout: Duration,
    page_timeout: Duration,
}

impl Fetcher {
    pub fn new(http: HttpFetcher, request_timeout: Duration, page_timeout: Duration) -> Self {
        Self {
            http,
            renderer: None,
            request_timeout,
            page_timeout,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("http", &self.http)
            .field("has_renderer", &self.renderer.is_some())
            .field("page_timeout", &self.page_timeout)
            .finish()
    }
}

#[async_trait]
impl Retriever for Fetcher {
    async fn retrieve(
        &self,
        resource: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage, FetchError> {
        match resource.mode {
            FetchMode::Plain => {
                with_deadline(
                    &resource.url,
                    self.request_timeout,
                    cancel,
                    self.http.fetch(&resource.url),
                )
                .await
            }
            FetchMode::Rendered => {
                let renderer = self.renderer.as_ref().ok_or_else(|| FetchError::Render {
                    url: resource.url.clone(),
                    message: "no rendering environment configured".to_string(),
                })?;
                let body = with_deadline(
                    &resource.url,
                    self.page_timeout,
                    cancel,
                    renderer.render(&resource.url),
                )
                .await?;
                Ok(FetchedPage {
                    url: resource.url.clone(),
                    final_url: resource.url.clone(),
                    body,
                    fetched_at: Utc::now(),
                })
            }
        }
    }

    async fn release(&self) {
        if let Some(renderer) = &self.renderer {
            renderer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRenderer {
        renders: AtomicUsize,
        shutdowns: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl PageRenderer for CountingRenderer {
        async fn render(&self, url: &str) -> Result<String, FetchError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Ok(format!("<html><body>{url}</body></html>"))
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fetcher_with(renderer: Arc<CountingRenderer>, page_timeout: Duration) -> Fetcher {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        Fetcher::new(http, Duration::from_secs(5), page_timeout).with_renderer(renderer)
    }

    #[tokio::test]
    async fn rendered_mode_goes_through_renderer_and_release_shuts_it_down() {
        let renderer = Arc::new(CountingRenderer::default());
        let fetcher = fetcher_with(renderer.clone(), Duration::from_secs(5));
        let page = fetcher
            .retrieve(
                &ResourceRef::rendered("https://snapbuy.test/deals"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(page.body.contains("snapbuy.test"));
        fetcher.release().await;
        assert_eq!(renderer.renders.load(Ordering::SeqCst), 1);
        assert_eq!(renderer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_render_hits_its_own_page_timeout() {
        let renderer = Arc::new(CountingRenderer {
            hang: true,
            ..Default::default()
        });
        let fetcher = fetcher_with(renderer, Duration::from_millis(40));
        let err = fetcher
            .retrieve(
                &ResourceRef::rendered("https://snapbuy.test/deals"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
        assert_eq!(err.kind(), ScanErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_retrieval() {
        let renderer = Arc::new(CountingRenderer {
            hang: true,
            ..Default::default()
        });
        let fetcher = fetcher_with(renderer, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetcher
            .retrieve(&ResourceRef::rendered("https://snapbuy.test/deals"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Cancelled {
                url: "https://snapbuy.test/deals".into()
            }
        );
    }

    #[tokio::test]
    async fn rendered_mode_without_renderer_is_a_soft_render_error() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let fetcher = Fetcher::new(http, Duration::from_secs(5), Duration::from_secs(5));
        let err = fetcher
            .retrieve(&ResourceRef::rendered("https://x.test/"), &CancellationToken::new())
            .await
            .unwrap_err();
        let scan_error = err.to_scan_error();
        assert_eq!(scan_error.kind, ScanErrorKind::Network);
        assert_eq!(scan_error.reference.as_deref(), Some("https://x.test/"));
    }
}

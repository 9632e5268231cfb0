//! Rendering environment for listing pages that only materialize after
//! scripts run and the page is scrolled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::FetchError;

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Load `url`, let dynamic content settle and return the resulting document.
    async fn render(&self, url: &str) -> Result<String, FetchError>;

    /// Release the environment. Safe to call more than once.
    async fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub chrome_path: Option<PathBuf>,
    pub max_scrolls: usize,
    pub settle_delay: Duration,
    pub navigation_timeout: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            chrome_path: None,
            max_scrolls: 12,
            settle_delay: Duration::from_millis(800),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

/// Decides when scroll-and-wait should stop: once the document height stops
/// growing, or after `max_scrolls` iterations.
#[derive(Debug, Clone)]
pub struct ScrollTracker {
    last_height: f64,
    iterations: usize,
    max_scrolls: usize,
}

impl ScrollTracker {
    pub fn new(initial_height: f64, max_scrolls: usize) -> Self {
        Self {
            last_height: initial_height,
            iterations: 0,
            max_scrolls,
        }
    }

    /// Records the height after one more scroll; returns whether to keep going.
    pub fn observe(&mut self, height: f64) -> bool {
        self.iterations += 1;
        let grew = height > self.last_height;
        self.last_height = self.last_height.max(height);
        grew && self.iterations < self.max_scrolls
    }

    pub fn can_scroll(&self) -> bool {
        self.iterations < self.max_scrolls
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

struct LiveBrowser {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

impl LiveBrowser {
    async fn teardown(self) {
        match Arc::try_unwrap(self.browser) {
            Ok(mut browser) => {
                if let Err(err) = browser.close().await {
                    debug!(error = %err, "closing rendering environment");
                }
                if let Err(err) = browser.wait().await {
                    debug!(error = %err, "waiting for rendering environment to exit");
                }
            }
            // An in-flight render still holds a handle; dropping ours lets the
            // process die with the last reference.
            Err(shared) => drop(shared),
        }
        self.handler.abort();
    }
}

/// Explicitly owned headless browser handle.
///
/// The browser launches lazily on the first render, is reused by later
/// renders, relaunches if the connection drops and is closed by
/// [`PageRenderer::shutdown`]. Renders may run concurrently; callers sharing
/// a session must shut it down only once the last of them is done.
pub struct BrowserSession {
    settings: RenderSettings,
    live: Mutex<Option<LiveBrowser>>,
    launches: AtomicUsize,
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("settings", &self.settings)
            .field("launches", &self.launches.load(Ordering::Relaxed))
            .finish()
    }
}

impl BrowserSession {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            live: Mutex::new(None),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    async fn browser(&self, url: &str) -> Result<Arc<Browser>, FetchError> {
        let mut live = self.live.lock().await;
        if let Some(current) = live.as_ref() {
            if current.connected.load(Ordering::Acquire) {
                return Ok(current.browser.clone());
            }
            warn!("rendering environment disconnected; relaunching");
            if let Some(stale) = live.take() {
                stale.teardown().await;
            }
        }

        let fresh = self.launch(url).await?;
        let browser = fresh.browser.clone();
        *live = Some(fresh);
        Ok(browser)
    }

    async fn launch(&self, url: &str) -> Result<LiveBrowser, FetchError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.settings.navigation_timeout);
        if let Some(path) = &self.settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(|message| FetchError::Render {
            url: url.to_string(),
            message,
        })?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| render_error(url, err))?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = connected.clone();
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "rendering environment connection lost");
                    break;
                }
            }
            flag.store(false, Ordering::Release);
        });

        let launches = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
        info!(launches, "rendering environment launched");
        Ok(LiveBrowser {
            browser: Arc::new(browser),
            handler,
            connected,
        })
    }

    async fn settle_and_extract(&self, page: &Page, url: &str) -> Result<String, FetchError> {
        page.wait_for_navigation()
            .await
            .map_err(|err| render_error(url, err))?;

        let initial = scroll_height(page, url).await?;
        let mut tracker = ScrollTracker::new(initial, self.settings.max_scrolls);
        while tracker.can_scroll() {
            page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                .await
                .map_err(|err| render_error(url, err))?;
            tokio::time::sleep(self.settings.settle_delay).await;
            let height = scroll_height(page, url).await?;
            if !tracker.observe(height) {
                break;
            }
        }
        debug!(url, scrolls = tracker.iterations(), "listing settled");

        page.content().await.map_err(|err| render_error(url, err))
    }
}

#[async_trait]
impl PageRenderer for BrowserSession {
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        let browser = self.browser(url).await?;
        let page = browser
            .new_page(url)
            .await
            .map_err(|err| render_error(url, err))?;
        let tab = OpenTab::new(page.clone(), url);
        let result = self.settle_and_extract(&page, url).await;
        tab.close().await;
        result
    }

    async fn shutdown(&self) {
        let stale = self.live.lock().await.take();
        if let Some(stale) = stale {
            stale.teardown().await;
            info!("rendering environment closed");
        }
    }
}

/// Closes its tab when dropped, so a render abandoned on timeout or
/// cancellation does not leave the tab open for the rest of the session.
struct OpenTab {
    page: Option<Page>,
    url: String,
}

impl OpenTab {
    fn new(page: Page, url: &str) -> Self {
        Self {
            page: Some(page),
            url: url.to_string(),
        }
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            close_page(page, &self.url).await;
        }
    }
}

impl Drop for OpenTab {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else { return };
        let url = std::mem::take(&mut self.url);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { close_page(page, &url).await });
            }
            Err(_) => debug!(url, "no runtime left to close an abandoned page"),
        }
    }
}

async fn close_page(page: Page, url: &str) {
    if let Err(err) = page.close().await {
        debug!(url, error = %err, "closing page");
    }
}

async fn scroll_height(page: &Page, url: &str) -> Result<f64, FetchError> {
    page.evaluate("document.body.scrollHeight")
        .await
        .map_err(|err| render_error(url, err))?
        .into_value::<f64>()
        .map_err(|err| render_error(url, err))
}

fn render_error(url: &str, err: impl std::fmt::Display) -> FetchError {
    FetchError::Render {
        url: url.to_string(),
        message: err.to_string(),
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

use crate::{FetchError, FetchedPage};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

/// Maps a non-success status onto the retrieval error taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> Option<FetchError> {
    if status.is_success() {
        None
    } else {
        Some(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

fn classify_reqwest_error(err: &reqwest::Error, url: &str, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            after: timeout,
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Single request/response fetcher. No retries: a failed call is reported
/// once and the caller decides what to do with it.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            timeout: config.timeout,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Cancelled { url: url.to_string() })?;

        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&err, url, self.timeout))?;

            let final_url = resp.url().to_string();
            if let Some(err) = classify_status(resp.status(), &final_url) {
                return Err(err);
            }

            let body = resp
                .text()
                .await
                .map_err(|err| classify_reqwest_error(&err, url, self.timeout))?;
            debug!(bytes = body.len(), "fetched");

            Ok(FetchedPage {
                url: url.to_string(),
                final_url,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

//! Fixture replay: serves captured pages keyed by URL, so sources can be
//! scanned offline and adapters can be exercised without a network.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{FetchError, FetchedPage, ResourceRef, Retriever};

#[derive(Debug, Deserialize)]
struct FixtureManifest {
    /// URL -> file path relative to the manifest.
    pages: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct FixtureRetriever {
    pages: HashMap<String, String>,
}

impl FixtureRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&mut self, url: impl Into<String>, body: impl Into<String>) {
        self.pages.insert(url.into(), body.into());
    }

    pub fn remove(&mut self, url: &str) -> Option<String> {
        self.pages.remove(url)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Loads a `manifest.json` of the form `{"pages": {"<url>": "<file>"}}`.
    pub fn from_manifest(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture manifest {}", path.display()))?;
        let manifest: FixtureManifest = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture manifest {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut retriever = Self::new();
        for (url, file) in manifest.pages {
            let page_path = base.join(&file);
            let body = std::fs::read_to_string(&page_path)
                .with_context(|| format!("reading fixture page {}", page_path.display()))?;
            retriever.insert(url, body);
        }
        Ok(retriever)
    }

    /// Merges another fixture set into this one; later pages win.
    pub fn extend(&mut self, other: FixtureRetriever) {
        self.pages.extend(other.pages);
    }
}

#[async_trait]
impl Retriever for FixtureRetriever {
    async fn retrieve(
        &self,
        resource: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                url: resource.url.clone(),
            });
        }
        match self.pages.get(&resource.url) {
            Some(body) => Ok(FetchedPage {
                url: resource.url.clone(),
                final_url: resource.url.clone(),
                body: body.clone(),
                fetched_at: Utc::now(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: resource.url.clone(),
            }),
        }
    }
}

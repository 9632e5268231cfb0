use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{with_deadline, FetchError, FetchedPage, ResourceRef, Retriever};

/// Upper bound on concurrent detail retrievals against one host.
pub const DETAIL_CONCURRENCY: usize = 4;

/// Pause between consecutive groups of [`DETAIL_CONCURRENCY`] retrievals.
pub const INTER_BATCH_DELAY: Duration = Duration::from_millis(750);

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Positionally aligned with the requested resources; `None` marks a failed item.
    pub pages: Vec<Option<FetchedPage>>,
    pub errors: Vec<FetchError>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }
}

/// Fetches detail references in groups of [`DETAIL_CONCURRENCY`].
///
/// A failed or timed-out item becomes `None` plus a soft error; nothing is
/// retried and the batch itself never fails.
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    per_item_timeout: Duration,
    inter_batch_delay: Duration,
}

impl BatchFetcher {
    pub fn new(per_item_timeout: Duration) -> Self {
        Self {
            per_item_timeout,
            inter_batch_delay: INTER_BATCH_DELAY,
        }
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub async fn fetch_all<F>(
        &self,
        retriever: &dyn Retriever,
        resources: &[ResourceRef],
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> BatchOutcome
    where
        F: FnMut(usize, usize),
    {
        let total = resources.len();
        let mut outcome = BatchOutcome {
            pages: Vec::with_capacity(total),
            errors: Vec::new(),
        };

        for (group_index, group) in resources.chunks(DETAIL_CONCURRENCY).enumerate() {
            if group_index > 0 && !self.inter_batch_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.inter_batch_delay) => {}
                }
            }

            let results = join_all(group.iter().map(|resource| {
                with_deadline(
                    &resource.url,
                    self.per_item_timeout,
                    cancel,
                    retriever.retrieve(resource, cancel),
                )
            }))
            .await;

            for result in results {
                match result {
                    Ok(page) => outcome.pages.push(Some(page)),
                    Err(err) => {
                        warn!(url = err.url(), error = %err, "detail retrieval failed");
                        outcome.errors.push(err);
                        outcome.pages.push(None);
                    }
                }
            }
            on_progress(outcome.pages.len(), total);
        }

        outcome
    }
}

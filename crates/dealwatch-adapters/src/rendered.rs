use async_trait::async_trait;
use dealwatch_core::{ScanCursor, ScanEvent, ScanPhase};
use dealwatch_storage::{FetchError, ResourceRef};
use tracing::{debug, info};
use url::Url;

use crate::listing::{apply_detail, extract_listing, ListingExtraction};
use crate::profiles::{DetailProfile, ListingProfile};
use crate::{AdapterContext, AdapterError, AdapterVariant, CandidateBatch, SourceAdapter};

/// Listing that only exists after rendering and scrolling. Rendering is too
/// expensive to repeat per chunk, so the first chunk snapshots the ordered
/// listing into the cursor and later chunks slice it by offset.
#[derive(Debug, Clone)]
pub struct RenderedAdapter {
    site: String,
    listing_url: String,
    listing: ListingProfile,
    detail: Option<DetailProfile>,
}

impl RenderedAdapter {
    pub fn new(
        site: impl Into<String>,
        listing_url: &str,
        filter: Option<&str>,
        listing: ListingProfile,
        detail: Option<DetailProfile>,
    ) -> Result<Self, AdapterError> {
        let site = site.into();
        let mut url = Url::parse(listing_url).map_err(|err| {
            AdapterError::Message(format!("{site}: invalid listing url `{listing_url}`: {err}"))
        })?;
        if let Some(filter) = filter {
            let param = listing.filter_param.ok_or_else(|| {
                AdapterError::Message(format!("{site}: listing does not support a pre-filter"))
            })?;
            url.query_pairs_mut().append_pair(param, filter);
        }
        Ok(Self {
            site,
            listing_url: url.to_string(),
            listing,
            detail,
        })
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }

    async fn snapshot_listing(
        &self,
        ctx: &AdapterContext<'_>,
        cursor: ScanCursor,
    ) -> Result<(ScanCursor, ListingExtraction), AdapterError> {
        ctx.emit(ScanEvent::new(&self.site, ScanPhase::Listing, "rendering listing"));
        let page = ctx
            .retriever
            .retrieve(&ResourceRef::rendered(&self.listing_url), &ctx.cancel)
            .await?;
        let mut extraction =
            extract_listing(&page.body, &page.final_url, &self.site, &self.listing);
        let found = extraction.candidates.len();
        info!(
            site = %self.site,
            found,
            blocks = extraction.blocks_seen,
            unidentified = extraction.unidentified,
            selector = extraction.block_selector.unwrap_or("-"),
            "listing snapshot taken"
        );
        ctx.emit(
            ScanEvent::new(&self.site, ScanPhase::Listing, format!("{found} candidates in listing"))
                .with_progress(found, found),
        );
        let candidates = std::mem::take(&mut extraction.candidates);
        Ok((cursor.with_listing(candidates), extraction))
    }
}

#[async_trait]
impl SourceAdapter for RenderedAdapter {
    fn source_site(&self) -> &str {
        &self.site
    }

    fn variant(&self) -> AdapterVariant {
        if self.detail.is_some() {
            AdapterVariant::RenderedListWithDetail
        } else {
            AdapterVariant::RenderedList
        }
    }

    async fn list_candidates(
        &self,
        ctx: &AdapterContext<'_>,
        limit: usize,
        cursor: Option<&ScanCursor>,
    ) -> Result<CandidateBatch, AdapterError> {
        let base = cursor.cloned().unwrap_or_else(|| ScanCursor::start(&self.site));
        let mut batch = CandidateBatch::default();
        let base = if base.listing.is_some() {
            base
        } else {
            let (snapshotted, extraction) = self.snapshot_listing(ctx, base).await?;
            // Deals whose identity could not be read cannot be marked observed.
            batch.degraded = extraction.unidentified > 0;
            batch.errors.extend(extraction.errors);
            snapshotted
        };

        let snapshot = base.listing.as_deref().unwrap_or_default();
        let start = base.offset.min(snapshot.len());
        let end = start.saturating_add(limit).min(snapshot.len());
        let mut slice = snapshot[start..end].to_vec();

        if let Some(detail) = &self.detail {
            let resources: Vec<ResourceRef> = slice
                .iter()
                .map(|c| ResourceRef {
                    url: c.source_url.clone(),
                    mode: detail.mode,
                })
                .collect();
            let outcome = ctx
                .details
                .fetch_all(ctx.retriever, &resources, &ctx.cancel, |done, total| {
                    let message = "fetching detail pages";
                    ctx.emit(
                        ScanEvent::new(&self.site, ScanPhase::FetchingDetail, message)
                            .with_progress(done, total),
                    )
                })
                .await;
            for (candidate, page) in slice.iter_mut().zip(&outcome.pages) {
                if let Some(page) = page {
                    let errors = apply_detail(candidate, &page.body, &page.final_url, detail);
                    batch.errors.extend(errors);
                }
            }
            batch.errors.extend(outcome.errors.iter().map(FetchError::to_scan_error));
        }

        debug!(site = %self.site, start, end, total = snapshot.len(), "rendered listing slice");
        if end < snapshot.len() {
            batch.next_cursor = Some(base.advanced(end - start));
        }
        batch.candidates = slice;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{LOCALFEAST, LOCALFEAST_DETAIL, SNAPBUY};
    use dealwatch_core::ScanErrorKind;
    use dealwatch_storage::{BatchFetcher, FixtureRetriever};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn cards(n: usize) -> String {
        let body: String = (1..=n)
            .map(|i| {
                format!(
                    r#"<div class="deal-card"><a class="deal-card__link" href="/deal/{i}?src=list">
                       <span class="deal-card__title">{i}0% off Shop {i}</span></a></div>"#
                )
            })
            .collect();
        format!("<html><body>{body}</body></html>")
    }

    fn ctx(retriever: &FixtureRetriever) -> AdapterContext<'_> {
        AdapterContext::new(
            retriever,
            CancellationToken::new(),
            BatchFetcher::new(Duration::from_secs(1)).with_inter_batch_delay(Duration::ZERO),
        )
    }

    fn snapbuy() -> RenderedAdapter {
        RenderedAdapter::new("snapbuy", "https://snapbuy.test/deals", None, SNAPBUY, None).unwrap()
    }

    #[test]
    fn filter_is_appended_to_the_listing_url() {
        let adapter = RenderedAdapter::new(
            "snapbuy",
            "https://snapbuy.test/deals",
            Some("food & drink"),
            SNAPBUY,
            None,
        )
        .unwrap();
        assert_eq!(adapter.listing_url(), "https://snapbuy.test/deals?category=food+%26+drink");
    }

    #[tokio::test]
    async fn listing_is_rendered_once_and_sliced_from_the_cursor() {
        let mut retriever =
            FixtureRetriever::new().with_page("https://snapbuy.test/deals", cards(5));
        let adapter = snapbuy();

        let first = adapter.list_candidates(&ctx(&retriever), 2, None).await.unwrap();
        assert_eq!(first.candidates.len(), 2);
        assert_eq!(first.candidates[0].source_url, "https://snapbuy.test/deal/1");
        assert_eq!(first.candidates[1].merchant_name, "Shop 2");
        let cursor = first.next_cursor.expect("more to come");
        assert_eq!(cursor.listing.as_ref().map(Vec::len), Some(5));

        // later chunks never touch the listing page again
        retriever.remove("https://snapbuy.test/deals");
        let second = adapter.list_candidates(&ctx(&retriever), 2, Some(&cursor)).await.unwrap();
        let third = adapter
            .list_candidates(&ctx(&retriever), 2, second.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(third.candidates.len(), 1);
        assert_eq!(third.candidates[0].source_url, "https://snapbuy.test/deal/5");
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn unreadable_deal_link_degrades_the_sequence() {
        let listing = r#"<html><body>
            <div class="deal-card">
              <a class="deal-card__link" href="/deal/1"><h3>Noodles</h3></a>
            </div>
            <div class="deal-card">
              <a class="deal-card__link" href="javascript:void(0)"><h3>Spa</h3></a>
            </div>
            </body></html>"#;
        let retriever = FixtureRetriever::new().with_page("https://snapbuy.test/deals", listing);
        let adapter = snapbuy();

        let batch = adapter.list_candidates(&ctx(&retriever), 10, None).await.unwrap();
        assert_eq!(batch.candidates.len(), 1);
        assert!(batch.degraded);
        assert_eq!(batch.errors.len(), 1);
    }

    #[tokio::test]
    async fn listing_failure_is_an_adapter_error() {
        let retriever = FixtureRetriever::new();
        let adapter = snapbuy();
        let err = adapter.list_candidates(&ctx(&retriever), 10, None).await.unwrap_err();
        assert!(matches!(err, AdapterError::Fetch(FetchError::HttpStatus { status: 404, .. })));
    }

    #[tokio::test]
    async fn detail_failures_keep_listing_fields() {
        let listing = r#"<html><body>
            <div class="offer-tile">
              <a class="offer-tile__link" href="/offer/1"><h3>50% off Sushi Tei</h3></a>
            </div>
            <div class="offer-tile">
              <a class="offer-tile__link" href="/offer/2"><h3>Pad Thai @ Bangkok Jam</h3></a>
            </div>
            </body></html>"#;
        let retriever = FixtureRetriever::new()
            .with_page("https://localfeast.test/offers", listing)
            .with_page(
                "https://localfeast.test/offer/1",
                r#"<html><body>
                   <div class="offer-detail__description">Omakase for two.</div>
                   </body></html>"#,
            );
        let adapter = RenderedAdapter::new(
            "localfeast",
            "https://localfeast.test/offers",
            None,
            LOCALFEAST,
            Some(LOCALFEAST_DETAIL),
        )
        .unwrap();

        let events = Mutex::new(Vec::new());
        let sink = |event: ScanEvent| events.lock().unwrap().push(event);
        let ctx = ctx(&retriever).with_events(&sink);
        let batch = adapter.list_candidates(&ctx, 10, None).await.unwrap();

        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(batch.candidates[0].description.as_deref(), Some("Omakase for two."));
        assert_eq!(batch.candidates[1].description, None);
        assert_eq!(batch.candidates[1].merchant_name, "Bangkok Jam");
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].kind, ScanErrorKind::HttpStatus);
        assert!(!batch.degraded);
        assert!(batch.next_cursor.is_none());

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| {
            e.phase == ScanPhase::FetchingDetail && e.progress.map(|p| p.current) == Some(2)
        }));
    }
}

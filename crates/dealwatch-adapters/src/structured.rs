use std::collections::HashSet;

use async_trait::async_trait;
use dealwatch_core::{
    CandidateDeal, PagePosition, ScanCursor, ScanError, ScanErrorKind, ScanEvent, ScanPhase,
};
use dealwatch_storage::ResourceRef;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use url::Url;

use crate::extract::{json_flag, json_items, json_number, json_text, json_units};
use crate::profiles::JsonProfile;
use crate::text::{canonical_url, derive_discount, parse_percent};
use crate::title::parse_title;
use crate::{AdapterContext, AdapterError, AdapterVariant, CandidateBatch, SourceAdapter};

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Paginated JSON listing. The cursor offset counts raw upstream items, so
/// inactive or duplicate entries still advance it.
#[derive(Debug, Clone)]
pub struct StructuredListAdapter {
    site: String,
    endpoint: Url,
    page_size: usize,
    profile: JsonProfile,
}

impl StructuredListAdapter {
    pub fn new(
        site: impl Into<String>,
        endpoint: &str,
        page_size: usize,
        profile: JsonProfile,
    ) -> Result<Self, AdapterError> {
        let site = site.into();
        let endpoint = Url::parse(endpoint).map_err(|err| {
            AdapterError::Message(format!("{site}: invalid endpoint `{endpoint}`: {err}"))
        })?;
        if page_size == 0 {
            return Err(AdapterError::Message(format!("{site}: page size must be positive")));
        }
        Ok(Self {
            site,
            endpoint,
            page_size,
            profile,
        })
    }

    pub fn page_url(&self, page: usize) -> String {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(self.profile.page_param, &page.to_string())
            .append_pair(self.profile.size_param, &self.page_size.to_string());
        url.to_string()
    }

    /// Identity of an item, if its link resolves.
    fn identity(&self, item: &JsonValue) -> Option<String> {
        let href = json_text(item, self.profile.url)?;
        canonical_url(Some(&self.endpoint), &href, false)
    }

    /// Builds a candidate once the identity is known. Missing descriptive
    /// fields never drop the item: the title falls back to the merchant, the
    /// badge and finally the link itself.
    fn candidate_from_item(&self, item: &JsonValue, source_url: String) -> CandidateDeal {
        let p = &self.profile;
        let explicit_merchant = json_text(item, p.merchant);
        let headline = json_text(item, p.title)
            .or_else(|| explicit_merchant.clone())
            .or_else(|| json_text(item, p.badge))
            .unwrap_or_else(|| source_url.clone());

        let parsed = parse_title(&headline);
        let (title, merchant_name) = match explicit_merchant {
            Some(merchant) => (headline, merchant),
            None => (parsed.title, parsed.merchant_name),
        };
        let offer_price = json_number(item, p.offer_price);
        let original_price = json_number(item, p.original_price);
        let badge = json_text(item, p.badge);
        let discount_percent = json_number(item, p.discount)
            .filter(|d| *d > 0.0 && *d <= 100.0)
            .or(parsed.discount_percent)
            .or_else(|| badge.as_deref().and_then(parse_percent))
            .or_else(|| derive_discount(original_price, offer_price));
        let image_url = json_text(item, p.image)
            .and_then(|src| canonical_url(Some(&self.endpoint), &src, false));

        CandidateDeal {
            source_site: self.site.clone(),
            source_url,
            merchant_name,
            title,
            original_price,
            offer_price,
            discount_percent,
            units_sold: json_units(item, p.units_sold),
            image_url,
            badge,
            description: json_text(item, p.description),
        }
    }

    /// Whether `page` is the last one, judged from response metadata and
    /// falling back to a short page.
    fn is_last_page(&self, body: &JsonValue, page: usize, items_on_page: usize) -> bool {
        if let Some(last) = json_number(body, self.profile.last_page) {
            return page as f64 >= last;
        }
        if let Some(has_more) = json_flag(body, self.profile.has_more) {
            return !has_more;
        }
        items_on_page < self.page_size
    }
}

#[async_trait]
impl SourceAdapter for StructuredListAdapter {
    fn source_site(&self) -> &str {
        &self.site
    }

    fn variant(&self) -> AdapterVariant {
        AdapterVariant::StructuredList
    }

    async fn list_candidates(
        &self,
        ctx: &AdapterContext<'_>,
        limit: usize,
        cursor: Option<&ScanCursor>,
    ) -> Result<CandidateBatch, AdapterError> {
        let base = cursor.cloned().unwrap_or_else(|| ScanCursor::start(&self.site));
        // Cursors written before pages were tracked only carry the offset.
        let mut position = base.page.unwrap_or(PagePosition {
            page: base.offset / self.page_size + 1,
            skip: base.offset % self.page_size,
        });
        let mut batch = CandidateBatch::default();
        let mut seen_ids = HashSet::new();
        let mut consumed = 0usize;
        let mut exhausted = false;

        while batch.candidates.len() < limit {
            let page = position.page;
            let url = self.page_url(page);
            ctx.emit(ScanEvent::new(
                &self.site,
                ScanPhase::Listing,
                format!("requesting page {page}"),
            ));

            let request = ResourceRef::plain(&url);
            let fetched = match ctx.retriever.retrieve(&request, &ctx.cancel).await {
                Ok(fetched) => fetched,
                Err(err) if consumed == 0 => return Err(err.into()),
                Err(err) => {
                    // Resume from this page next time; nothing has been skipped.
                    warn!(site = %self.site, page, error = %err, "listing page failed mid-chunk");
                    batch.errors.push(err.to_scan_error());
                    break;
                }
            };

            let body: JsonValue = match serde_json::from_str(&fetched.body) {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        site = %self.site,
                        page,
                        error = %err,
                        "listing page is not JSON; skipping it"
                    );
                    batch.errors.push(
                        ScanError::new(
                            ScanErrorKind::Parse,
                            format!("page {page} is not valid JSON: {err}"),
                        )
                        .with_reference(&url),
                    );
                    batch.degraded = true;
                    consumed += self.page_size.saturating_sub(position.skip);
                    position = position.next_page();
                    break;
                }
            };

            let Some(items) = json_items(&body, self.profile.items) else {
                batch.errors.push(
                    ScanError::new(ScanErrorKind::Parse, format!("page {page} has no item list"))
                        .with_reference(&url),
                );
                batch.degraded = true;
                exhausted = true;
                break;
            };
            let last_page = self.is_last_page(&body, page, items.len());
            if items.is_empty() {
                if !last_page {
                    // Upstream claims more pages but served none; the
                    // enumeration cannot be trusted to be whole.
                    warn!(site = %self.site, page, "empty page before the last one");
                    batch.errors.push(
                        ScanError::new(
                            ScanErrorKind::Parse,
                            format!("page {page} is empty but not the last page"),
                        )
                        .with_reference(&url),
                    );
                    batch.degraded = true;
                }
                exhausted = true;
                break;
            }

            for item in items.iter().skip(position.skip) {
                if batch.candidates.len() >= limit {
                    break;
                }
                consumed += 1;
                position.skip += 1;
                if json_flag(item, self.profile.active) == Some(false) {
                    continue;
                }
                if let Some(id) = json_text(item, self.profile.id) {
                    if !seen_ids.insert(id) {
                        continue;
                    }
                }
                let Some(source_url) = self.identity(item) else {
                    // Without an identity the item cannot be marked observed.
                    batch.errors.push(
                        ScanError::new(
                            ScanErrorKind::Parse,
                            format!("page {page}: item has no usable url"),
                        )
                        .with_reference(&url),
                    );
                    batch.degraded = true;
                    continue;
                };
                // Pages shift while a sequence is in progress; an identity an
                // earlier chunk already reconciled is not yielded twice.
                if base.observed.contains(&source_url) {
                    debug!(site = %self.site, url = %source_url, "already observed this sequence");
                    continue;
                }
                batch.candidates.push(self.candidate_from_item(item, source_url));
            }

            if position.skip >= items.len() {
                if last_page {
                    exhausted = true;
                    break;
                }
                position = position.next_page();
            }
        }

        debug!(
            site = %self.site,
            candidates = batch.candidates.len(),
            consumed,
            page = position.page,
            exhausted,
            "structured listing chunk enumerated"
        );
        if !exhausted {
            batch.next_cursor = Some(base.advanced(consumed).at_page(position));
        }
        Ok(batch)
    }
}

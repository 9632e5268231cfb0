//! Markup extraction for rendered listings and detail pages. Everything here
//! is synchronous; parsed documents never live across an await point.

use std::collections::HashSet;

use dealwatch_core::{CandidateDeal, ScanError, ScanErrorKind};
use scraper::{ElementRef, Html};
use url::Url;

use crate::extract::{first_match, SelectorCache};
use crate::profiles::{DetailProfile, ListingProfile};
use crate::text::{
    canonical_url, derive_discount, parse_percent, parse_price, parse_units_sold, text_or_none,
};
use crate::title::parse_title;

#[derive(Debug, Default)]
pub struct ListingExtraction {
    /// Document order, deduplicated by canonical URL.
    pub candidates: Vec<CandidateDeal>,
    pub errors: Vec<ScanError>,
    pub block_selector: Option<&'static str>,
    pub blocks_seen: usize,
    /// Blocks carrying a link that did not resolve to an identity.
    pub unidentified: usize,
}

enum BlockOutcome {
    Deal(CandidateDeal),
    /// No link at all: a placeholder or banner, not a deal.
    Placeholder,
    /// A link that cannot be turned into an identity.
    Unidentified(String),
}

pub fn extract_listing(
    html: &str,
    page_url: &str,
    site: &str,
    profile: &ListingProfile,
) -> ListingExtraction {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let mut cache = SelectorCache::default();
    let mut out = ListingExtraction::default();

    let matched = profile.blocks.iter().find_map(|css| {
        let selector = cache.get(*css)?;
        let blocks: Vec<ElementRef<'_>> = document.select(&selector).collect();
        (!blocks.is_empty()).then_some((*css, blocks))
    });
    let Some((block_selector, blocks)) = matched else {
        out.errors.push(
            ScanError::new(ScanErrorKind::Parse, "no listing blocks matched any known layout")
                .with_reference(page_url),
        );
        push_selector_failures(&mut out.errors, &mut cache, page_url);
        return out;
    };
    out.block_selector = Some(block_selector);
    out.blocks_seen = blocks.len();

    let mut seen = HashSet::new();
    for (index, block) in blocks.into_iter().enumerate() {
        match candidate_from_block(block, site, profile, &mut cache, base.as_ref()) {
            BlockOutcome::Deal(candidate) => {
                if seen.insert(candidate.source_url.clone()) {
                    out.candidates.push(candidate);
                }
            }
            BlockOutcome::Placeholder => out.errors.push(
                ScanError::new(ScanErrorKind::Parse, format!("listing block {index}: no deal link"))
                    .with_reference(page_url),
            ),
            BlockOutcome::Unidentified(href) => {
                out.unidentified += 1;
                out.errors.push(
                    ScanError::new(
                        ScanErrorKind::Parse,
                        format!("listing block {index}: unusable deal link `{href}`"),
                    )
                    .with_reference(page_url),
                );
            }
        }
    }
    push_selector_failures(&mut out.errors, &mut cache, page_url);
    out
}

fn candidate_from_block(
    block: ElementRef<'_>,
    site: &str,
    profile: &ListingProfile,
    cache: &mut SelectorCache,
    base: Option<&Url>,
) -> BlockOutcome {
    let Some(href) = first_match(block, profile.link, cache) else {
        return BlockOutcome::Placeholder;
    };
    let Some(source_url) = canonical_url(base, &href, true) else {
        return BlockOutcome::Unidentified(href);
    };

    let headline = first_match(block, profile.title, cache)
        .or_else(|| {
            text_or_none(&block.text().collect::<String>()).map(|t| t.chars().take(140).collect())
        })
        .unwrap_or_else(|| source_url.clone());
    let parsed = parse_title(&headline);
    let explicit_merchant = first_match(block, profile.merchant, cache);
    let (title, merchant_name) = match explicit_merchant {
        Some(merchant) => (headline.clone(), merchant),
        None => (parsed.title.clone(), parsed.merchant_name.clone()),
    };

    let offer_price = first_match(block, profile.offer_price, cache).and_then(|t| parse_price(&t));
    let original_price =
        first_match(block, profile.original_price, cache).and_then(|t| parse_price(&t));
    let badge = first_match(block, profile.badge, cache);
    let discount_percent = first_match(block, profile.discount, cache)
        .and_then(|t| parse_percent(&t))
        .or(parsed.discount_percent)
        .or_else(|| badge.as_deref().and_then(parse_percent))
        .or_else(|| derive_discount(original_price, offer_price));
    let units_sold =
        first_match(block, profile.units_sold, cache).and_then(|t| parse_units_sold(&t));
    let image_url =
        first_match(block, profile.image, cache).and_then(|src| canonical_url(base, &src, false));

    BlockOutcome::Deal(CandidateDeal {
        source_site: site.to_string(),
        source_url,
        merchant_name,
        title,
        original_price,
        offer_price,
        discount_percent,
        units_sold,
        image_url,
        badge,
        description: None,
    })
}

/// Folds detail-page fields into a listing candidate. The detail image wins
/// over the listing thumbnail; listing values are kept when the detail page
/// lacks a field.
pub fn apply_detail(
    candidate: &mut CandidateDeal,
    html: &str,
    page_url: &str,
    profile: &DetailProfile,
) -> Vec<ScanError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let base = Url::parse(page_url).ok();
    let mut cache = SelectorCache::default();

    if let Some(description) = first_match(root, profile.description, &mut cache) {
        candidate.description = Some(description);
    }
    if let Some(image) = first_match(root, profile.image, &mut cache)
        .and_then(|src| canonical_url(base.as_ref(), &src, false))
    {
        candidate.image_url = Some(image);
    }
    if candidate.units_sold.is_none() {
        candidate.units_sold =
            first_match(root, profile.units_sold, &mut cache).and_then(|t| parse_units_sold(&t));
    }
    if let Some(merchant) = first_match(root, profile.merchant, &mut cache) {
        candidate.merchant_name = merchant;
    }

    let mut errors = Vec::new();
    push_selector_failures(&mut errors, &mut cache, page_url);
    errors
}

fn push_selector_failures(errors: &mut Vec<ScanError>, cache: &mut SelectorCache, page_url: &str) {
    errors.extend(
        cache
            .take_failures()
            .into_iter()
            .map(|message| ScanError::new(ScanErrorKind::Parse, message).with_reference(page_url)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{LOCALFEAST, LOCALFEAST_DETAIL, SNAPBUY};

    const DRIFTED: &str = r#"
    <html><body>
      <div data-deal-id="1"><a href="/deal/ramen?ref=home">
        <h3>Ramen Set at Ippudo</h3></a>
        <span class="price-now">$12</span><del>$20</del>
      </div>
      <div data-deal-id="2"><h3>No link here</h3></div>
      <div data-deal-id="3"><a href="/deal/ramen#reviews"><h3>Ramen Set at Ippudo</h3></a></div>
      <div data-deal-id="4"><a href="/deal/spa"><h3>Massage</h3></a>
        <span class="deal-card__badge">-35%</span></div>
    </body></html>"#;

    #[test]
    fn fallback_blocks_are_used_when_primary_layout_is_absent() {
        let out = extract_listing(DRIFTED, "https://snapbuy.test/deals", "snapbuy", &SNAPBUY);
        assert_eq!(out.block_selector, Some("[data-deal-id]"));
        assert_eq!(out.blocks_seen, 4);
        // duplicate URL collapsed, linkless block reported
        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.unidentified, 0);
        assert_eq!(out.errors[0].kind, ScanErrorKind::Parse);

        let ramen = &out.candidates[0];
        assert_eq!(ramen.source_url, "https://snapbuy.test/deal/ramen");
        assert_eq!(ramen.title, "Ramen Set");
        assert_eq!(ramen.merchant_name, "Ippudo");
        assert_eq!(ramen.offer_price, Some(12.0));
        assert_eq!(ramen.original_price, Some(20.0));
        assert_eq!(ramen.discount_percent, Some(40.0));

        let spa = &out.candidates[1];
        assert_eq!(spa.merchant_name, "Massage");
        assert_eq!(spa.discount_percent, Some(35.0));
        assert_eq!(spa.badge.as_deref(), Some("-35%"));
    }

    #[test]
    fn blocks_without_headline_keep_their_identity() {
        let html = r#"<div class="deal-card">
            <a class="deal-card__link" href="/deal/42"><img src="/x.jpg"></a></div>
            <div class="deal-card">
            <a class="deal-card__link" href="javascript:void(0)"><h3>Broken</h3></a></div>"#;
        let out = extract_listing(html, "https://snapbuy.test/deals", "snapbuy", &SNAPBUY);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].source_url, "https://snapbuy.test/deal/42");
        assert_eq!(out.candidates[0].title, "https://snapbuy.test/deal/42");
        assert_eq!(out.unidentified, 1);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn unknown_layout_yields_a_parse_error_and_no_candidates() {
        let html = "<html><body><p>maintenance</p></body></html>";
        let out = extract_listing(html, "https://snapbuy.test/", "snapbuy", &SNAPBUY);
        assert!(out.candidates.is_empty());
        assert_eq!(out.block_selector, None);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn detail_page_enriches_candidate() {
        let listing = r#"<div class="offer-tile">
            <a class="offer-tile__link" href="/offer/7"><h3>50% off Sushi Tei</h3></a>
            <img src="/thumb/7.jpg"></div>"#;
        let mut candidate =
            extract_listing(listing, "https://localfeast.test/offers", "localfeast", &LOCALFEAST)
                .candidates
                .remove(0);
        assert_eq!(candidate.merchant_name, "Sushi Tei");
        assert_eq!(candidate.image_url.as_deref(), Some("https://localfeast.test/thumb/7.jpg"));

        let detail = r#"<html><head>
            <meta property="og:image" content="https://cdn.localfeast.test/7/hero.jpg">
            </head><body>
            <div class="offer-detail__description">Two sushi platters and green tea.</div>
            <span class="offer-detail__sold">1.1k purchased</span>
            </body></html>"#;
        let detail_url = "https://localfeast.test/offer/7";
        let errors = apply_detail(&mut candidate, detail, detail_url, &LOCALFEAST_DETAIL);
        assert!(errors.is_empty());
        assert_eq!(candidate.description.as_deref(), Some("Two sushi platters and green tea."));
        assert_eq!(candidate.image_url.as_deref(), Some("https://cdn.localfeast.test/7/hero.jpg"));
        assert_eq!(candidate.units_sold, Some(1100));
        assert_eq!(candidate.discount_percent, Some(50.0));
    }
}

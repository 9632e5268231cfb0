//! Per-site extraction tables. Adding a site with a known layout family is a
//! matter of adding a profile here and registering it in [`crate::adapter_for_source`].

use dealwatch_storage::FetchMode;

use crate::extract::{Chain, JsonChain, Probe};

/// Card-style listing markup.
#[derive(Debug, Clone, Copy)]
pub struct ListingProfile {
    /// Candidate block selectors, tried in order; the first one matching any
    /// element defines the blocks.
    pub blocks: &'static [&'static str],
    pub link: Chain,
    pub title: Chain,
    pub merchant: Chain,
    pub offer_price: Chain,
    pub original_price: Chain,
    pub discount: Chain,
    pub units_sold: Chain,
    pub image: Chain,
    pub badge: Chain,
    /// Query parameter used to pre-filter the listing, if the site has one.
    pub filter_param: Option<&'static str>,
}

/// Per-deal detail page markup, applied on top of a listing candidate.
#[derive(Debug, Clone, Copy)]
pub struct DetailProfile {
    pub mode: FetchMode,
    pub description: Chain,
    pub image: Chain,
    pub units_sold: Chain,
    pub merchant: Chain,
}

/// Paginated JSON listing API.
#[derive(Debug, Clone, Copy)]
pub struct JsonProfile {
    pub items: JsonChain,
    pub id: JsonChain,
    pub url: JsonChain,
    pub title: JsonChain,
    pub merchant: JsonChain,
    pub offer_price: JsonChain,
    pub original_price: JsonChain,
    pub discount: JsonChain,
    pub units_sold: JsonChain,
    pub image: JsonChain,
    pub badge: JsonChain,
    pub description: JsonChain,
    pub active: JsonChain,
    pub last_page: JsonChain,
    pub has_more: JsonChain,
    pub page_param: &'static str,
    pub size_param: &'static str,
}

pub const CITYDEALS: JsonProfile = JsonProfile {
    items: &["data", "deals", "items", "results"],
    id: &["id", "deal_id", "uuid"],
    url: &["url", "permalink", "links.web"],
    title: &["title", "name", "headline"],
    merchant: &["merchant.name", "merchant_name", "vendor.name"],
    offer_price: &["price.offer", "sale_price", "price"],
    original_price: &["price.original", "original_price", "list_price"],
    discount: &["discount_percent", "price.discount", "discount"],
    units_sold: &["sold_count", "units_sold", "stats.sold"],
    image: &["image.large", "image_url", "images.0"],
    badge: &["badge", "labels.0"],
    description: &["summary", "description"],
    active: &["is_active", "active", "status"],
    last_page: &["meta.last_page", "meta.total_pages", "pagination.pages"],
    has_more: &["meta.has_more", "pagination.has_more"],
    page_param: "page",
    size_param: "per_page",
};

pub const SNAPBUY: ListingProfile = ListingProfile {
    blocks: &["div.deal-card", "[data-deal-id]", "article.deal", "li.deal"],
    link: &[
        Probe::Attr("a.deal-card__link", "href"),
        Probe::Attr("a[href*='/deal']", "href"),
        Probe::OwnAttr("data-href"),
        Probe::Attr("a[href]", "href"),
    ],
    title: &[
        Probe::Text(".deal-card__title"),
        Probe::Text("h3"),
        Probe::Text("h2"),
        Probe::Text("[class*='title']"),
        Probe::Attr("img", "alt"),
    ],
    merchant: &[
        Probe::Text(".deal-card__merchant"),
        Probe::Text("[class*='merchant']"),
        Probe::OwnAttr("data-merchant"),
    ],
    offer_price: &[
        Probe::Text(".deal-card__price--now"),
        Probe::Text(".price-now"),
        Probe::Text("[class*='price'] strong"),
        Probe::OwnAttr("data-price"),
    ],
    original_price: &[
        Probe::Text(".deal-card__price--was"),
        Probe::Text(".price-was"),
        Probe::Text("del"),
        Probe::Text("s"),
    ],
    discount: &[Probe::Text(".deal-card__discount"), Probe::Text("[class*='discount']")],
    units_sold: &[
        Probe::Text(".deal-card__sold"),
        Probe::Text("[class*='sold']"),
        Probe::Text("[class*='bought']"),
    ],
    image: &[
        Probe::Attr("img.deal-card__image", "src"),
        Probe::Attr("img", "data-src"),
        Probe::Attr("img", "src"),
    ],
    badge: &[Probe::Text(".deal-card__badge"), Probe::Text("[class*='badge']")],
    filter_param: Some("category"),
};

pub const LOCALFEAST: ListingProfile = ListingProfile {
    blocks: &["div.offer-tile", "[data-offer]", "li.offer"],
    link: &[
        Probe::Attr("a.offer-tile__link", "href"),
        Probe::Attr("a[href*='/offer']", "href"),
        Probe::Attr("a[href]", "href"),
    ],
    title: &[
        Probe::Text(".offer-tile__headline"),
        Probe::Text("h3"),
        Probe::Text("h4"),
        Probe::Attr("img", "alt"),
    ],
    merchant: &[Probe::Text(".offer-tile__venue")],
    offer_price: &[Probe::Text(".offer-tile__price"), Probe::Text("[class*='price'] b")],
    original_price: &[Probe::Text(".offer-tile__rrp"), Probe::Text("del")],
    discount: &[Probe::Text(".offer-tile__saving")],
    units_sold: &[Probe::Text(".offer-tile__sold")],
    image: &[Probe::Attr("img", "data-src"), Probe::Attr("img", "src")],
    badge: &[Probe::Text(".offer-tile__ribbon"), Probe::Text(".ribbon")],
    filter_param: None,
};

pub const LOCALFEAST_DETAIL: DetailProfile = DetailProfile {
    mode: FetchMode::Plain,
    description: &[
        Probe::Text(".offer-detail__description"),
        Probe::Text("[itemprop='description']"),
        Probe::Attr("meta[name='description']", "content"),
        Probe::Attr("meta[property='og:description']", "content"),
    ],
    image: &[
        Probe::Attr("meta[property='og:image']", "content"),
        Probe::Attr(".offer-gallery img", "data-zoom-src"),
        Probe::Attr(".offer-gallery img", "src"),
    ],
    units_sold: &[Probe::Text(".offer-detail__sold"), Probe::Text("[class*='purchased']")],
    merchant: &[
        Probe::Text(".offer-detail__venue"),
        Probe::Text("[itemprop='name']"),
    ],
};

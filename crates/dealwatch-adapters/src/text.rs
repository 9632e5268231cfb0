//! Free-text field parsing shared by every adapter.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("percent pattern"));

static UNITS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(?:([km])\b)?").expect("units pattern")
});

static SALES_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sold|bought|purchased|redeemed|claimed)\b").expect("sales word pattern")
});

static BARE_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*\d[\d,]*(?:\.\d+)?\s*[km]?\s*\+?\s*$").expect("bare count pattern")
});

/// Trims and collapses inner whitespace; empty input becomes `None`.
pub fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Every number in `text`, tolerating thousands separators (`1,299.00`).
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        let next_is_digit = chars.peek().is_some_and(|c| c.is_ascii_digit());
        if ch == ',' && !current.is_empty() && !seen_dot && next_is_digit {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() && next_is_digit {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

pub fn parse_price(text: &str) -> Option<f64> {
    extract_numbers(text).first().copied()
}

pub fn parse_percent(text: &str) -> Option<f64> {
    PERCENT
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|p| *p > 0.0 && *p <= 100.0)
}

/// `"1.2k sold"` -> 1200, `"Sold: 2,345"` -> 2345. Text must name a sale
/// or be a bare count; `"5 min ago"` is not a sold count.
pub fn parse_units_sold(text: &str) -> Option<u64> {
    if !SALES_WORD.is_match(text) && !BARE_COUNT.is_match(text) {
        return None;
    }
    let caps = UNITS.captures(text)?;
    let base: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(suffix) if suffix == "k" => 1_000.0,
        Some(suffix) if suffix == "m" => 1_000_000.0,
        _ => 1.0,
    };
    Some((base * multiplier).round() as u64)
}

/// Discount implied by a price pair, rounded to two decimals.
pub fn derive_discount(original: Option<f64>, offer: Option<f64>) -> Option<f64> {
    let (original, offer) = (original?, offer?);
    if original <= 0.0 || offer < 0.0 || offer > original {
        return None;
    }
    Some(round2((original - offer) / original * 100.0))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Resolves `href` against `base` and drops the fragment. With
/// `strip_query`, the query string is dropped too so tracking parameters do
/// not split one deal into several identities.
pub fn canonical_url(base: Option<&Url>, href: &str, strip_query: bool) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    let mut url = match Url::parse(href) {
        Ok(url) => url,
        Err(_) => base?.join(href).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    if strip_query {
        url.set_query(None);
    }
    Some(url.to_string())
}

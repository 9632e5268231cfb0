//! Ordered fallback chains for pulling fields out of markup and JSON.
//!
//! Upstream layouts drift, so every field is described as a list of probes;
//! the first probe that yields a non-empty value wins.

use std::collections::HashMap;

use scraper::{ElementRef, Selector};
use serde_json::Value as JsonValue;

use crate::text::{parse_price, parse_units_sold, text_or_none};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Text of the first matching descendant.
    Text(&'static str),
    /// Attribute of the first matching descendant.
    Attr(&'static str, &'static str),
    /// Attribute on the scope element itself.
    OwnAttr(&'static str),
}

pub type Chain = &'static [Probe];

/// Parses each selector at most once per extraction and remembers the ones
/// that failed to parse.
#[derive(Debug, Default)]
pub struct SelectorCache {
    parsed: HashMap<&'static str, Option<Selector>>,
    failures: Vec<String>,
}

impl SelectorCache {
    pub fn get(&mut self, css: &'static str) -> Option<Selector> {
        if let Some(cached) = self.parsed.get(css) {
            return cached.clone();
        }
        let parsed = match Selector::parse(css) {
            Ok(selector) => Some(selector),
            Err(err) => {
                self.failures.push(format!("invalid selector `{css}`: {err}"));
                None
            }
        };
        self.parsed.insert(css, parsed.clone());
        parsed
    }

    pub fn take_failures(&mut self) -> Vec<String> {
        std::mem::take(&mut self.failures)
    }
}

pub fn first_match(
    scope: ElementRef<'_>,
    chain: Chain,
    cache: &mut SelectorCache,
) -> Option<String> {
    for probe in chain {
        let value = match *probe {
            Probe::Text(css) => {
                let Some(selector) = cache.get(css) else { continue };
                scope
                    .select(&selector)
                    .find_map(|el| text_or_none(&el.text().collect::<String>()))
            }
            Probe::Attr(css, attr) => {
                let Some(selector) = cache.get(css) else { continue };
                scope
                    .select(&selector)
                    .find_map(|el| el.value().attr(attr).and_then(text_or_none))
            }
            Probe::OwnAttr(attr) => scope.value().attr(attr).and_then(text_or_none),
        };
        if value.is_some() {
            return value;
        }
    }
    None
}

/// Dotted paths into a JSON document; numeric segments index arrays.
pub type JsonChain = &'static [&'static str];

pub fn json_at<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let found = path.split('.').try_fold(value, |cur, segment| match cur {
        JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => cur.get(segment),
    })?;
    (!found.is_null()).then_some(found)
}

pub fn json_text(value: &JsonValue, chain: JsonChain) -> Option<String> {
    chain.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn json_number(value: &JsonValue, chain: JsonChain) -> Option<f64> {
    chain.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    })
}

pub fn json_units(value: &JsonValue, chain: JsonChain) -> Option<u64> {
    chain.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0).round() as u64)),
        JsonValue::String(s) => parse_units_sold(s),
        _ => None,
    })
}

pub fn json_flag(value: &JsonValue, chain: JsonChain) -> Option<bool> {
    chain.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "active" | "live" | "open" | "true" | "yes" => Some(true),
            "expired" | "inactive" | "closed" | "sold_out" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// The item array of a listing response: the root itself when it is an
/// array, otherwise the first chain entry that points at one.
pub fn json_items<'a>(value: &'a JsonValue, chain: JsonChain) -> Option<&'a Vec<JsonValue>> {
    if let JsonValue::Array(items) = value {
        return Some(items);
    }
    chain.iter().find_map(|path| json_at(value, path)?.as_array())
}

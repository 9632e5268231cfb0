//! Headline decomposition. Deal headlines often carry the merchant and the
//! discount inline ("50% off Sushi Tei", "1-for-1 Bubble Tea at Koi"); the
//! rule table below is tried in order and the first match wins.

use std::sync::LazyLock;

use regex::Regex;

use crate::text::{round2, text_or_none};

static PERCENT_OFF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:up\s+to\s+)?(\d{1,3}(?:\.\d+)?)\s*%\s*off\s+(?:(?:at|on|@)\s+)?(.+?)$")
        .expect("percent-off pattern")
});

static MULTI_FOR_ONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)^(\d{1,2})\s*(?:×|x|-\s*for\s*-|\s+for\s+)\s*1\b\s*",
        r"(?:deal\s+)?(?:(?:at|on|@)\s+)?(.+?)$",
    ))
    .expect("multi-for-one pattern")
});

static NAME_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?)\s+(?:at|on|@)\s+(.+?)$").expect("name-suffix pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleRule {
    /// `<P>% off <name>`
    PercentOff,
    /// `<N>×1 on <name>` and the `1-for-1` spelling.
    MultiForOne,
    /// `<title> at <name>` / `<title> @ <name>`
    NameSuffix,
}

pub const TITLE_RULES: &[TitleRule] = &[
    TitleRule::PercentOff,
    TitleRule::MultiForOne,
    TitleRule::NameSuffix,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTitle {
    pub title: String,
    pub merchant_name: String,
    pub discount_percent: Option<f64>,
    /// `None` when no rule matched and the whole headline was kept.
    pub rule: Option<TitleRule>,
}

impl TitleRule {
    fn apply(self, headline: &str) -> Option<ParsedTitle> {
        match self {
            TitleRule::PercentOff => {
                let caps = PERCENT_OFF.captures(headline)?;
                let percent = caps[1].parse::<f64>().ok().filter(|p| *p <= 100.0)?;
                Some(ParsedTitle {
                    title: headline.to_string(),
                    merchant_name: trailing_name(&caps[2]),
                    discount_percent: Some(percent),
                    rule: Some(self),
                })
            }
            TitleRule::MultiForOne => {
                let caps = MULTI_FOR_ONE.captures(headline)?;
                let n = caps[1].parse::<u32>().ok()?.max(2);
                Some(ParsedTitle {
                    title: headline.to_string(),
                    merchant_name: trailing_name(&caps[2]),
                    discount_percent: Some(round2((1.0 - 1.0 / f64::from(n)) * 100.0)),
                    rule: Some(self),
                })
            }
            TitleRule::NameSuffix => {
                let caps = NAME_SUFFIX.captures(headline)?;
                Some(ParsedTitle {
                    title: caps[1].trim().to_string(),
                    merchant_name: caps[2].trim().to_string(),
                    discount_percent: None,
                    rule: Some(self),
                })
            }
        }
    }
}

// "Dinner Buffet at Marina Hotel" -> "Marina Hotel"
fn trailing_name(rest: &str) -> String {
    NAME_SUFFIX
        .captures(rest)
        .map(|caps| caps[2].trim().to_string())
        .unwrap_or_else(|| rest.trim().to_string())
}

pub fn parse_title(text: &str) -> ParsedTitle {
    let headline = text_or_none(text).unwrap_or_default();
    TITLE_RULES
        .iter()
        .find_map(|rule| rule.apply(&headline))
        .unwrap_or_else(|| ParsedTitle {
            title: headline.clone(),
            merchant_name: headline,
            discount_percent: None,
            rule: None,
        })
}

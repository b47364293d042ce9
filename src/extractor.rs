//! Extractor
//!
//! Turns one rendered list page into candidate records plus the
//! pagination signal for the page after it. Pure: no I/O, no state.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::dedup::canonicalize_url;
use crate::driver::RenderedPage;
use crate::pattern::{PaginationStrategy, PatternEntry, SelectorSpec};
use crate::schemas::CandidateRecord;

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").unwrap());

/// Result of extracting one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub candidates: Vec<CandidateRecord>,
    pub has_next_page: bool,
    /// Continuation token for token-based pagination
    pub next_token: Option<String>,
    /// Record anchor selector matched nothing (or failed to parse)
    pub structural_mismatch: bool,
}

impl Extraction {
    /// Zero records, no next page
    pub fn mismatch() -> Self {
        Self {
            structural_mismatch: true,
            ..Default::default()
        }
    }
}

struct CompiledField<'a> {
    selector: Selector,
    attribute: Option<&'a str>,
}

impl<'a> CompiledField<'a> {
    fn compile(spec: Option<&'a SelectorSpec>) -> Option<Self> {
        let spec = spec?;
        Some(Self {
            selector: Selector::parse(&spec.selector).ok()?,
            attribute: spec.attribute.as_deref(),
        })
    }

    fn read(&self, scope: ElementRef<'_>) -> Option<String> {
        let node = scope.select(&self.selector).next()?;
        let raw = match self.attribute {
            Some(attr) => node.value().attr(attr)?.to_string(),
            None => node.text().collect::<Vec<_>>().join(" "),
        };
        let value = collapse_whitespace(&raw);
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Extracts candidate records and the next-page signal from `page`
pub fn extract(page: &RenderedPage, pattern: &PatternEntry) -> Extraction {
    let Ok(record_selector) = Selector::parse(&pattern.fields.record) else {
        debug!(source = %pattern.source_id, selector = %pattern.fields.record, "Record selector failed to parse");
        return Extraction::mismatch();
    };

    let document = Html::parse_document(&page.html);
    let records: Vec<ElementRef<'_>> = document.select(&record_selector).collect();
    if records.is_empty() {
        debug!(source = %pattern.source_id, url = %page.final_url, "No record anchors on page");
        return Extraction::mismatch();
    }

    let fields = &pattern.fields;
    let email = CompiledField::compile(fields.email.as_ref());
    let first_name = CompiledField::compile(fields.first_name.as_ref());
    let last_name = CompiledField::compile(fields.last_name.as_ref());
    let full_name = CompiledField::compile(fields.full_name.as_ref());
    let company = CompiledField::compile(fields.company.as_ref());
    let source_ref = CompiledField::compile(fields.source_ref.as_ref());

    let base_url = Url::parse(&page.final_url).ok();

    let candidates: Vec<CandidateRecord> = records
        .iter()
        .map(|record| {
            let email = email
                .as_ref()
                .and_then(|f| f.read(*record))
                .filter(|v| v.contains('@'))
                .or_else(|| scan_email(*record))
                .unwrap_or_default();

            let (first, last) = match (
                first_name.as_ref().and_then(|f| f.read(*record)),
                last_name.as_ref().and_then(|f| f.read(*record)),
            ) {
                (None, None) => full_name
                    .as_ref()
                    .and_then(|f| f.read(*record))
                    .map(|name| split_full_name(&name))
                    .unwrap_or_default(),
                (first, last) => (first.unwrap_or_default(), last.unwrap_or_default()),
            };

            let source_ref = source_ref
                .as_ref()
                .and_then(|f| f.read(*record))
                .map(|raw| resolve_ref(base_url.as_ref(), &raw))
                .unwrap_or_default();

            CandidateRecord {
                source_id: pattern.source_id.clone(),
                email,
                first_name: first,
                last_name: last,
                company_or_firm: company.as_ref().and_then(|f| f.read(*record)).unwrap_or_default(),
                source_ref,
                page_url: page.final_url.clone(),
            }
        })
        .collect();

    let (has_next_page, next_token) = match &pattern.pagination {
        PaginationStrategy::OffsetBased { page_size, next_selector, .. } => {
            let has_next = match next_selector {
                Some(sel) => find_enabled(&document, sel),
                None => candidates.len() as u64 >= *page_size,
            };
            (has_next, None)
        }
        PaginationStrategy::TokenBased { token_selector, token_attribute, token_param } => {
            let token = read_token(&document, token_selector, token_attribute.as_deref())
                .and_then(|raw| token_from_value(&raw, base_url.as_ref(), token_param));
            (token.is_some(), token)
        }
        PaginationStrategy::InteractiveWidget { next_button, .. } => (find_enabled(&document, next_button), None),
    };

    debug!(
        source = %pattern.source_id,
        url = %page.final_url,
        records = candidates.len(),
        has_next_page,
        "Extracted page"
    );

    Extraction {
        candidates,
        has_next_page,
        next_token,
        structural_mismatch: false,
    }
}

/// First e-mail in the record's text, then in its markup (`mailto:` hrefs)
fn scan_email(record: ElementRef<'_>) -> Option<String> {
    let text = record.text().collect::<Vec<_>>().join(" ");
    if let Some(m) = EMAIL_REGEX.find(&text) {
        return Some(m.as_str().to_string());
    }
    let html = record.html();
    EMAIL_REGEX.find(&html).map(|m| m.as_str().to_string())
}

/// "Last, First" or "First Middle Last"
fn split_full_name(name: &str) -> (String, String) {
    if let Some((last, first)) = name.split_once(',') {
        return (collapse_whitespace(first), collapse_whitespace(last));
    }
    match name.trim().rsplit_once(char::is_whitespace) {
        Some((first, last)) => (collapse_whitespace(first), last.trim().to_string()),
        None => (name.trim().to_string(), String::new()),
    }
}

fn resolve_ref(base: Option<&Url>, raw: &str) -> String {
    let absolute = match base {
        Some(base) if !raw.is_empty() => base.join(raw).map(|u| u.to_string()).ok(),
        _ => None,
    };
    match absolute {
        // Only URL-like refs get resolved; plain ids are kept as-is
        Some(url) if raw.starts_with('?') || raw.contains('/') => {
            canonicalize_url(&url).unwrap_or(url)
        }
        _ => raw.to_string(),
    }
}

fn find_enabled(document: &Html, selector: &str) -> bool {
    let Ok(selector) = Selector::parse(selector) else {
        return false;
    };
    document.select(&selector).any(|el| !is_disabled(el))
}

fn is_disabled(el: ElementRef<'_>) -> bool {
    let node = el.value();
    node.attr("disabled").is_some()
        || node.attr("aria-disabled").is_some_and(|v| v.eq_ignore_ascii_case("true"))
        || node.classes().any(|c| c.eq_ignore_ascii_case("disabled"))
}

fn read_token(document: &Html, selector: &str, attribute: Option<&str>) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let node = document.select(&selector).find(|el| !is_disabled(*el))?;
    let raw = match attribute {
        Some(attr) => node.value().attr(attr)?.to_string(),
        None => node.text().collect::<String>(),
    };
    let raw = raw.trim().to_string();
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

/// Tokens read from an `href` carry the token in `token_param`
fn token_from_value(raw: &str, base: Option<&Url>, token_param: &str) -> Option<String> {
    let looks_like_link = raw.starts_with('?') || raw.starts_with('/') || raw.starts_with("http");
    if looks_like_link {
        if let Some(url) = base.and_then(|b| b.join(raw).ok()) {
            return url
                .query_pairs()
                .find(|(k, _)| k == token_param)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty());
        }
    }
    Some(raw.to_string())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

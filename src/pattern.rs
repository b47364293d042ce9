//! Pattern Registry
//!
//! Per-source declarative description of list pages, pagination mechanics
//! and record fields. Entries are data, stored through the persistence
//! sink and addressed one source at a time, so a new source (or a
//! non-productive flag) never needs a redeploy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::driver::{PageRequest, WidgetAction};
use crate::error::{HarvestError, Result};
use crate::schemas::ProgressCursor;
use crate::store::PersistenceSink;

/// How a source paginates its list pages.
///
/// Closed set: the orchestrator matches on the tag instead of probing
/// the shape of the entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationStrategy {
    /// `?offset=40` or `{page}` style navigable URLs
    #[serde(rename_all = "camelCase")]
    OffsetBased {
        /// Query parameter appended when the template has no placeholder
        #[serde(default)]
        offset_param: Option<String>,
        page_size: u64,
        #[serde(default)]
        start_offset: u64,
        /// Present on the page while more pages exist
        #[serde(default)]
        next_selector: Option<String>,
    },
    /// Opaque continuation token read from the current page
    #[serde(rename_all = "camelCase")]
    TokenBased {
        token_selector: String,
        #[serde(default)]
        token_attribute: Option<String>,
        token_param: String,
    },
    /// Stateful widget with no navigable URL per page
    #[serde(rename_all = "camelCase")]
    InteractiveWidget {
        #[serde(default)]
        category_select: Option<String>,
        #[serde(default)]
        submit_selector: Option<String>,
        next_button: String,
    },
}

impl PaginationStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            PaginationStrategy::OffsetBased { .. } => "offset_based",
            PaginationStrategy::TokenBased { .. } => "token_based",
            PaginationStrategy::InteractiveWidget { .. } => "interactive_widget",
        }
    }
}

/// CSS selector plus optional attribute to read instead of element text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    pub selector: String,
    #[serde(default)]
    pub attribute: Option<String>,
}

impl SelectorSpec {
    pub fn text(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attribute: None,
        }
    }

    pub fn attr(selector: &str, attribute: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attribute: Some(attribute.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelectors {
    /// Anchor selector matching one node per record. Absent anchors mean
    /// the page layout no longer matches this pattern.
    pub record: String,
    #[serde(default)]
    pub email: Option<SelectorSpec>,
    #[serde(default)]
    pub first_name: Option<SelectorSpec>,
    #[serde(default)]
    pub last_name: Option<SelectorSpec>,
    /// Used when first/last name are not split on the page
    #[serde(default)]
    pub full_name: Option<SelectorSpec>,
    #[serde(default)]
    pub company: Option<SelectorSpec>,
    #[serde(default)]
    pub source_ref: Option<SelectorSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitOverride {
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NonProductiveMark {
    pub marked_at: DateTime<Utc>,
    pub reason: String,
    pub urls_visited: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatternEntry {
    pub source_id: String,
    #[serde(default)]
    pub display_name: String,
    /// List-page URL template: `{category}`, `{offset}`, `{page}`, `{token}`
    pub list_url: String,
    /// Page needs JavaScript rendering
    #[serde(default)]
    pub render_js: bool,
    pub pagination: PaginationStrategy,
    pub fields: FieldSelectors,
    /// Category codes walked in order (practice areas, regions, ...)
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitOverride>,
    /// Selector the browser waits for before returning content
    #[serde(default)]
    pub wait_for: Option<String>,
    #[serde(default)]
    pub non_productive: Option<NonProductiveMark>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PatternEntry {
    pub fn is_productive(&self) -> bool {
        self.non_productive.is_none()
    }

    pub fn needs_browser(&self) -> bool {
        self.render_js || matches!(self.pagination, PaginationStrategy::InteractiveWidget { .. })
    }

    /// Checks selectors and URL templates before the entry is stored
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(HarvestError::invalid_pattern(&self.source_id, msg));

        if self.source_id.trim().is_empty() {
            return fail("sourceId is empty".to_string());
        }
        if url::Url::parse(&strip_placeholders(&self.list_url)).is_err() {
            return fail(format!("listUrl is not a valid URL template: {}", self.list_url));
        }

        let mut selectors: Vec<&str> = vec![self.fields.record.as_str()];
        for spec in [
            &self.fields.email,
            &self.fields.first_name,
            &self.fields.last_name,
            &self.fields.full_name,
            &self.fields.company,
            &self.fields.source_ref,
        ]
        .into_iter()
        .flatten()
        {
            selectors.push(spec.selector.as_str());
        }
        if let Some(ref wait_for) = self.wait_for {
            selectors.push(wait_for);
        }

        let uses_category = self.list_url.contains("{category}");
        match &self.pagination {
            PaginationStrategy::OffsetBased { offset_param, page_size, next_selector, .. } => {
                if *page_size == 0 {
                    return fail("pageSize must be at least 1".to_string());
                }
                let has_placeholder = self.list_url.contains("{offset}") || self.list_url.contains("{page}");
                if !has_placeholder && offset_param.is_none() {
                    return fail("offset pagination needs {offset}, {page} or offsetParam".to_string());
                }
                if let Some(sel) = next_selector {
                    selectors.push(sel);
                }
                if !self.categories.is_empty() && !uses_category {
                    return fail("categories require a {category} placeholder".to_string());
                }
            }
            PaginationStrategy::TokenBased { token_selector, .. } => {
                selectors.push(token_selector);
                if !self.categories.is_empty() && !uses_category {
                    return fail("categories require a {category} placeholder".to_string());
                }
            }
            PaginationStrategy::InteractiveWidget { category_select, submit_selector, next_button } => {
                selectors.push(next_button);
                if let Some(sel) = submit_selector {
                    selectors.push(sel);
                }
                match category_select {
                    Some(sel) => selectors.push(sel),
                    None if !self.categories.is_empty() && !uses_category => {
                        return fail("categories require categorySelect or a {category} placeholder".to_string());
                    }
                    None => {}
                }
            }
        }

        for selector in selectors {
            if scraper::Selector::parse(selector).is_err() {
                return fail(format!("invalid CSS selector: {}", selector));
            }
        }
        Ok(())
    }

    /// Builds the request for the next unprocessed page of `cursor`
    pub fn build_request(&self, cursor: &ProgressCursor) -> PageRequest {
        let category = cursor.category_code.as_deref().unwrap_or("");
        let base = self.list_url.replace("{category}", &encode(category));

        match &self.pagination {
            PaginationStrategy::OffsetBased { offset_param, page_size, .. } => {
                let offset = cursor.current_offset;
                let page = offset / (*page_size).max(1) + 1;
                let mut url = base
                    .replace("{offset}", &offset.to_string())
                    .replace("{page}", &page.to_string());
                if !self.list_url.contains("{offset}") && !self.list_url.contains("{page}") {
                    if let Some(param) = offset_param {
                        url = append_query(&url, param, &offset.to_string());
                    }
                }
                PageRequest::Navigate { url }
            }
            PaginationStrategy::TokenBased { token_param, .. } => {
                let url = match cursor.current_page_token.as_deref() {
                    Some(token) if self.list_url.contains("{token}") => base.replace("{token}", &encode(token)),
                    Some(token) => append_query(&base, token_param, token),
                    None => base.replace("{token}", ""),
                };
                PageRequest::Navigate { url }
            }
            PaginationStrategy::InteractiveWidget { category_select, submit_selector, next_button } => {
                let mut actions = Vec::new();
                if let (Some(select), Some(code)) = (category_select, cursor.category_code.as_ref()) {
                    actions.push(WidgetAction::Select {
                        selector: select.clone(),
                        value: code.clone(),
                    });
                }
                if let Some(submit) = submit_selector {
                    actions.push(WidgetAction::Click { selector: submit.clone() });
                    actions.push(WidgetAction::WaitFor { selector: self.fields.record.clone() });
                }
                // Replay from a fresh load: page k is k clicks on "next"
                for _ in 0..cursor.pages_completed {
                    actions.push(WidgetAction::Click { selector: next_button.clone() });
                    actions.push(WidgetAction::WaitFor { selector: self.fields.record.clone() });
                }
                PageRequest::Interactive { url: base, actions }
            }
        }
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn strip_placeholders(template: &str) -> String {
    ["{category}", "{offset}", "{page}", "{token}"]
        .iter()
        .fold(template.to_string(), |acc, p| acc.replace(p, "0"))
}

fn append_query(url: &str, key: &str, value: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair(key, value);
            parsed.to_string()
        }
        Err(_) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{}{}{}={}", url, sep, key, encode(value))
        }
    }
}

/// Typed access to pattern entries stored in the persistence sink
#[derive(Clone)]
pub struct PatternRegistry {
    sink: Arc<dyn PersistenceSink>,
}

impl PatternRegistry {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }

    pub async fn get(&self, source_id: &str) -> Result<PatternEntry> {
        self.sink
            .load_pattern(source_id)
            .await?
            .ok_or_else(|| HarvestError::PatternNotFound(source_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<PatternEntry>> {
        let mut entries = self.sink.list_patterns().await?;
        entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(entries)
    }

    /// Validates and stores an entry, replacing any previous version
    pub async fn put(&self, mut entry: PatternEntry) -> Result<()> {
        entry.validate()?;
        entry.updated_at = Some(Utc::now());
        self.sink.save_pattern(&entry).await
    }

    /// Flags a source as non-productive. The only writer after import.
    pub async fn mark_non_productive(&self, source_id: &str, reason: &str, urls_visited: u64) -> Result<()> {
        let mut entry = self.get(source_id).await?;
        if entry.non_productive.is_some() {
            return Ok(());
        }
        warn!(source = %source_id, reason = %reason, urls_visited, "Marking source non-productive");
        entry.non_productive = Some(NonProductiveMark {
            marked_at: Utc::now(),
            reason: reason.to_string(),
            urls_visited,
        });
        entry.updated_at = Some(Utc::now());
        self.sink.save_pattern(&entry).await
    }

    /// Operator override after a trip
    pub async fn clear_non_productive(&self, source_id: &str) -> Result<()> {
        let mut entry = self.get(source_id).await?;
        if entry.non_productive.take().is_some() {
            info!(source = %source_id, "Cleared non-productive mark");
            entry.updated_at = Some(Utc::now());
            self.sink.save_pattern(&entry).await?;
        }
        Ok(())
    }

    /// Imports a JSON file holding one entry or an array of entries
    pub async fn import_file(&self, path: &Path) -> Result<usize> {
        let contents = tokio::fs::read_to_string(path).await?;
        let value: serde_json::Value = serde_json::from_str(&contents)?;
        let entries: Vec<PatternEntry> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };

        let count = entries.len();
        for entry in entries {
            let source_id = entry.source_id.clone();
            self.put(entry).await?;
            info!(source = %source_id, "Imported pattern");
        }
        Ok(count)
    }
}

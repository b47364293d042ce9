//! Progress Cursor Schema
//!
//! Persisted pagination position for one source. Everything before the
//! cursor has been fully fetched, extracted and persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCursor {
    pub source_id: String,
    /// Category currently being walked (`None` for sources without categories)
    #[serde(default)]
    pub category_code: Option<String>,
    /// Categories whose pagination was walked to the end, in completion order
    #[serde(default)]
    pub completed_category_codes: Vec<String>,
    /// Offset of the next page to fetch (offset-based pagination)
    #[serde(default)]
    pub current_offset: u64,
    /// Token of the next page to fetch (token-based pagination)
    #[serde(default)]
    pub current_page_token: Option<String>,
    /// Pages fully processed in the active category
    #[serde(default)]
    pub pages_completed: u64,
    /// Consecutive pages at this position that failed after retries
    #[serde(default)]
    pub failed_pages: u32,
    /// Every category has been walked to the end
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Totally ordered view of a cursor, used to check that progress only
/// ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CursorPosition {
    pub categories_done: usize,
    pub exhausted: bool,
    pub pages_completed: u64,
}

impl ProgressCursor {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            category_code: None,
            completed_category_codes: Vec::new(),
            current_offset: 0,
            current_page_token: None,
            pages_completed: 0,
            failed_pages: 0,
            exhausted: false,
            last_run_at: None,
        }
    }

    pub fn is_category_completed(&self, code: &str) -> bool {
        self.completed_category_codes.iter().any(|c| c == code)
    }

    pub fn position(&self) -> CursorPosition {
        CursorPosition {
            categories_done: self.completed_category_codes.len(),
            exhausted: self.exhausted,
            pages_completed: self.pages_completed,
        }
    }
}

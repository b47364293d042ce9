//! Progress Tracker
//!
//! Owns the per-source cursor: where the next run resumes, which
//! categories are finished, and whether the source is exhausted. Cursor
//! transitions are pure functions; the tracker only adds load/save.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FetchError, Result};
use crate::extractor::Extraction;
use crate::pattern::{PaginationStrategy, PatternEntry};
use crate::schemas::{CursorPosition, ProgressCursor};
use crate::store::PersistenceSink;

#[derive(Clone)]
pub struct ProgressTracker {
    sink: Arc<dyn PersistenceSink>,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }

    /// Stored cursor, or a fresh one for a never-seen source
    pub async fn load(&self, source_id: &str) -> Result<ProgressCursor> {
        match self.sink.load_cursor(source_id).await? {
            Some(cursor) => {
                debug!(
                    source = %source_id,
                    category = ?cursor.category_code,
                    pages = cursor.pages_completed,
                    "Resuming from stored cursor"
                );
                Ok(cursor)
            }
            None => {
                info!(source = %source_id, "No cursor stored, starting fresh");
                Ok(ProgressCursor::new(source_id))
            }
        }
    }

    pub async fn save(&self, cursor: &ProgressCursor) -> Result<()> {
        self.sink.save_cursor(cursor).await
    }

    /// Wipes a source's cursor so the next run starts from the beginning
    pub async fn reset(&self, source_id: &str) -> Result<()> {
        self.save(&ProgressCursor::new(source_id)).await
    }
}

/// Makes sure a category is active before the first fetch.
///
/// A cursor resting on a category that is completed or no longer listed
/// moves to the first pending one; no pending category means exhausted.
pub fn begin(cursor: &mut ProgressCursor, pattern: &PatternEntry) {
    if cursor.exhausted {
        return;
    }

    if pattern.categories.is_empty() {
        if cursor.pages_completed == 0 && cursor.current_page_token.is_none() {
            cursor.current_offset = start_offset(pattern);
        }
        return;
    }

    let active_is_pending = cursor
        .category_code
        .as_deref()
        .is_some_and(|code| pattern.categories.iter().any(|c| c == code) && !cursor.is_category_completed(code));

    if active_is_pending {
        if cursor.pages_completed == 0 && cursor.current_page_token.is_none() {
            cursor.current_offset = start_offset(pattern);
        }
    } else {
        activate_next_category(cursor, pattern);
    }
}

/// Moves the cursor past one fully processed page
pub fn advance_page(cursor: &mut ProgressCursor, pattern: &PatternEntry, extraction: &Extraction) {
    cursor.pages_completed += 1;
    cursor.failed_pages = 0;
    match &pattern.pagination {
        PaginationStrategy::OffsetBased { page_size, .. } => {
            cursor.current_offset += page_size;
        }
        PaginationStrategy::TokenBased { .. } => {
            cursor.current_page_token = extraction.next_token.clone();
        }
        PaginationStrategy::InteractiveWidget { .. } => {}
    }
    cursor.last_run_at = Some(Utc::now());
}

/// Where the cursor went after a page failed even with retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedPage {
    /// Moved past the failed page; the category goes on
    Skipped,
    /// Left on the failed page for a later run
    Paused,
    /// Not Found right after a skipped page: the skipped one was the last
    CategoryDone,
}

/// Moves the cursor after a page that could not be loaded.
///
/// A failure alone never completes a category. The first failure at a
/// position skips the page when the next one is addressable without it
/// (offsets and widget replay; a token only comes from the page itself).
/// Further failures pause on the page, except a 404/410 directly after a
/// skip, which means pagination ran off the end.
pub fn fail_page(cursor: &mut ProgressCursor, pattern: &PatternEntry, error: &FetchError) -> FailedPage {
    cursor.last_run_at = Some(Utc::now());
    let skippable = !matches!(pattern.pagination, PaginationStrategy::TokenBased { .. });

    if skippable && cursor.failed_pages > 0 && matches!(error, FetchError::HttpStatus(404 | 410)) {
        advance_category(cursor, pattern);
        return FailedPage::CategoryDone;
    }

    if skippable && cursor.failed_pages == 0 {
        cursor.pages_completed += 1;
        if let PaginationStrategy::OffsetBased { page_size, .. } = &pattern.pagination {
            cursor.current_offset += page_size;
        }
        cursor.failed_pages = 1;
        return FailedPage::Skipped;
    }

    cursor.failed_pages = cursor.failed_pages.saturating_add(1);
    FailedPage::Paused
}

/// Marks the active category complete and activates the next pending one,
/// or flags the cursor exhausted when none is left
pub fn advance_category(cursor: &mut ProgressCursor, pattern: &PatternEntry) {
    if let Some(code) = cursor.category_code.take() {
        if !cursor.is_category_completed(&code) {
            cursor.completed_category_codes.push(code);
        }
    }
    cursor.last_run_at = Some(Utc::now());

    if pattern.categories.is_empty() {
        reset_pagination(cursor, pattern);
        cursor.exhausted = true;
        return;
    }
    activate_next_category(cursor, pattern);
}

/// Totally ordered position used to check progress never moves backwards
pub fn position(cursor: &ProgressCursor) -> CursorPosition {
    cursor.position()
}

fn activate_next_category(cursor: &mut ProgressCursor, pattern: &PatternEntry) {
    reset_pagination(cursor, pattern);
    match pattern.categories.iter().find(|c| !cursor.is_category_completed(c)) {
        Some(next) => {
            debug!(source = %cursor.source_id, category = %next, "Activating category");
            cursor.category_code = Some(next.clone());
        }
        None => {
            cursor.category_code = None;
            cursor.exhausted = true;
        }
    }
}

fn reset_pagination(cursor: &mut ProgressCursor, pattern: &PatternEntry) {
    cursor.current_offset = start_offset(pattern);
    cursor.current_page_token = None;
    cursor.pages_completed = 0;
    cursor.failed_pages = 0;
}

fn start_offset(pattern: &PatternEntry) -> u64 {
    match pattern.pagination {
        PaginationStrategy::OffsetBased { start_offset, .. } => start_offset,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::FieldSelectors;
    use crate::store::MemorySink;

    fn pattern(categories: &[&str]) -> PatternEntry {
        PatternEntry {
            source_id: "s1".to_string(),
            display_name: String::new(),
            list_url: "https://dir.example.com/{category}?o={offset}".to_string(),
            render_js: false,
            pagination: PaginationStrategy::OffsetBased {
                offset_param: None,
                page_size: 20,
                start_offset: 1,
                next_selector: None,
            },
            fields: FieldSelectors {
                record: "li".to_string(),
                ..Default::default()
            },
            categories: categories.iter().map(|c| c.to_string()).collect(),
            rate_limit: None,
            wait_for: None,
            non_productive: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_begin_activates_first_category() {
        let pattern = pattern(&["A", "B"]);
        let mut cursor = ProgressCursor::new("s1");
        begin(&mut cursor, &pattern);
        assert_eq!(cursor.category_code.as_deref(), Some("A"));
        assert_eq!(cursor.current_offset, 1);
    }

    #[test]
    fn test_begin_keeps_paused_position() {
        let pattern = pattern(&["A", "B"]);
        let mut cursor = ProgressCursor::new("s1");
        begin(&mut cursor, &pattern);
        advance_page(&mut cursor, &pattern, &Extraction::default());
        advance_page(&mut cursor, &pattern, &Extraction::default());

        let paused = cursor.clone();
        begin(&mut cursor, &pattern);
        assert_eq!(cursor, paused);
        assert_eq!(cursor.current_offset, 41);
        assert_eq!(cursor.pages_completed, 2);
    }

    #[test]
    fn test_advance_category_walks_in_order() {
        let pattern = pattern(&["A", "B"]);
        let mut cursor = ProgressCursor::new("s1");
        begin(&mut cursor, &pattern);
        advance_page(&mut cursor, &pattern, &Extraction::default());

        let before = position(&cursor);
        advance_category(&mut cursor, &pattern);
        assert!(position(&cursor) > before);
        assert_eq!(cursor.category_code.as_deref(), Some("B"));
        assert_eq!(cursor.completed_category_codes, vec!["A"]);
        assert_eq!(cursor.pages_completed, 0);

        advance_category(&mut cursor, &pattern);
        assert!(cursor.exhausted);
        assert_eq!(cursor.category_code, None);
    }

    #[test]
    fn test_removed_category_is_skipped() {
        let mut cursor = ProgressCursor::new("s1");
        cursor.category_code = Some("gone".to_string());
        cursor.pages_completed = 3;
        begin(&mut cursor, &pattern(&["A"]));
        assert_eq!(cursor.category_code.as_deref(), Some("A"));
        assert_eq!(cursor.pages_completed, 0);
    }

    #[test]
    fn test_uncategorized_source_exhausts() {
        let pattern = pattern(&[]);
        let mut cursor = ProgressCursor::new("s1");
        begin(&mut cursor, &pattern);
        assert_eq!(cursor.category_code, None);
        advance_category(&mut cursor, &pattern);
        assert!(cursor.exhausted);
    }

    #[test]
    fn test_token_page_advance() {
        let mut pattern = pattern(&[]);
        pattern.pagination = PaginationStrategy::TokenBased {
            token_selector: "a.more".to_string(),
            token_attribute: None,
            token_param: "after".to_string(),
        };
        let mut cursor = ProgressCursor::new("s1");
        let extraction = Extraction {
            has_next_page: true,
            next_token: Some("t2".to_string()),
            ..Default::default()
        };
        advance_page(&mut cursor, &pattern, &extraction);
        assert_eq!(cursor.current_page_token.as_deref(), Some("t2"));
        assert_eq!(cursor.pages_completed, 1);
    }

    #[test]
    fn test_failed_page_is_skipped_not_completed() {
        let pattern = pattern(&["A", "B"]);
        let mut cursor = ProgressCursor::new("s1");
        begin(&mut cursor, &pattern);

        assert_eq!(fail_page(&mut cursor, &pattern, &FetchError::Timeout), FailedPage::Skipped);
        assert_eq!(cursor.category_code.as_deref(), Some("A"));
        assert!(cursor.completed_category_codes.is_empty());
        assert_eq!(cursor.current_offset, 21);
        assert_eq!(cursor.pages_completed, 1);

        // A second failure in a row stays put
        let paused = cursor.clone();
        assert_eq!(fail_page(&mut cursor, &pattern, &FetchError::HttpStatus(500)), FailedPage::Paused);
        assert_eq!(cursor.current_offset, paused.current_offset);
        assert_eq!(cursor.failed_pages, 2);

        // Success clears the streak
        advance_page(&mut cursor, &pattern, &Extraction::default());
        assert_eq!(cursor.failed_pages, 0);
    }

    #[test]
    fn test_not_found_after_skip_ends_category() {
        let pattern = pattern(&["A", "B"]);
        let mut cursor = ProgressCursor::new("s1");
        begin(&mut cursor, &pattern);

        // A lone 404 is skipped like any failure
        assert_eq!(fail_page(&mut cursor, &pattern, &FetchError::HttpStatus(404)), FailedPage::Skipped);
        assert_eq!(fail_page(&mut cursor, &pattern, &FetchError::HttpStatus(404)), FailedPage::CategoryDone);
        assert_eq!(cursor.completed_category_codes, vec!["A"]);
        assert_eq!(cursor.category_code.as_deref(), Some("B"));
        assert_eq!(cursor.failed_pages, 0);
    }

    #[test]
    fn test_failed_token_page_pauses() {
        let mut pattern = pattern(&[]);
        pattern.pagination = PaginationStrategy::TokenBased {
            token_selector: "a.more".to_string(),
            token_attribute: None,
            token_param: "after".to_string(),
        };
        let mut cursor = ProgressCursor::new("s1");
        cursor.current_page_token = Some("t3".to_string());

        assert_eq!(fail_page(&mut cursor, &pattern, &FetchError::Timeout), FailedPage::Paused);
        assert_eq!(fail_page(&mut cursor, &pattern, &FetchError::HttpStatus(404)), FailedPage::Paused);
        assert_eq!(cursor.current_page_token.as_deref(), Some("t3"));
        assert!(!cursor.exhausted);
    }

    #[tokio::test]
    async fn test_tracker_load_and_save() {
        let tracker = ProgressTracker::new(Arc::new(MemorySink::new()));
        let mut cursor = tracker.load("s1").await.unwrap();
        assert_eq!(cursor, ProgressCursor::new("s1"));

        cursor.pages_completed = 7;
        tracker.save(&cursor).await.unwrap();
        assert_eq!(tracker.load("s1").await.unwrap().pages_completed, 7);

        tracker.reset("s1").await.unwrap();
        assert_eq!(tracker.load("s1").await.unwrap().pages_completed, 0);
    }
}

//! Orchestrator behavior against a scripted directory site
//!
//! Run with: cargo test --test harvest_properties

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{
    broken_page, directory_pattern, harvester, member_page, no_email_page, page_url, ScriptedDriver, SOURCE,
};
use contact_harvester::harvester::RunOptions;
use contact_harvester::schemas::{CandidateRecord, CircuitState, RunOutcome};
use contact_harvester::store::{FileSink, MemorySink, PersistenceSink};
use contact_harvester::{FetchError, HarvestError};

/// Category A: three pages, category B: two pages, nine distinct e-mails
fn two_category_site(driver: &ScriptedDriver) {
    driver.page(&page_url("A", 0), member_page(&["a1@smithlaw.com", "a2@smithlaw.com"], true));
    driver.page(&page_url("A", 1), member_page(&["a3@jonesllp.com", "a4@jonesllp.com"], true));
    driver.page(&page_url("A", 2), member_page(&["a5@doe-partners.com"], false));
    driver.page(&page_url("B", 0), member_page(&["b1@lexgroup.com", "b2@lexgroup.com"], true));
    driver.page(&page_url("B", 1), member_page(&["b3@counsel.org", "b4@counsel.org"], false));
}

fn emails(sink: &MemorySink) -> HashSet<String> {
    sink.all_contacts().into_iter().map(|c| c.email).collect()
}

fn unbounded() -> RunOptions {
    RunOptions {
        max_urls: 1000,
        dry_run: false,
    }
}

async fn setup(categories: &[&str]) -> (Arc<MemorySink>, Arc<ScriptedDriver>, contact_harvester::Harvester) {
    let sink = Arc::new(MemorySink::new());
    let driver = ScriptedDriver::new();
    let harvester = harvester(sink.clone(), driver.clone());
    harvester.registry().put(directory_pattern(categories)).await.unwrap();
    (sink, driver, harvester)
}

#[tokio::test]
async fn test_full_walk_exhausts_source() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    two_category_site(&driver);

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.urls_visited, 5);
    assert_eq!(summary.contacts_found, 9);
    assert_eq!(emails(&sink).len(), 9);
    assert_eq!(driver.request_count(), 5);

    // Profile links are resolved and stripped of tracking parameters
    let contact = &sink.all_contacts()[0];
    assert_eq!(contact.source_ref, "https://dir.test/profile/0");
    assert_eq!(contact.company_or_firm, "Firm 0 LLP");

    let cursor = sink.load_cursor(SOURCE).await.unwrap().unwrap();
    assert!(cursor.exhausted);
    assert_eq!(cursor.completed_category_codes, vec!["A", "B"]);

    let again = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();
    assert_eq!(again.outcome, RunOutcome::AlreadyExhausted);
    assert_eq!(driver.request_count(), 5);
}

#[tokio::test]
async fn test_budgeted_runs_match_one_unbounded_run() {
    let (full_sink, full_driver, full) = setup(&["A", "B"]).await;
    two_category_site(&full_driver);
    full.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    two_category_site(&driver);

    let one_page = RunOptions {
        max_urls: 1,
        dry_run: false,
    };
    let mut last_position = None;
    let mut outcomes = Vec::new();
    for _ in 0..10 {
        let summary = harvester.run_source(SOURCE, one_page, &CancellationToken::new()).await.unwrap();
        outcomes.push(summary.outcome);

        // Progress never moves backwards
        let position = sink.load_cursor(SOURCE).await.unwrap().unwrap().position();
        if let Some(previous) = last_position {
            assert!(position >= previous);
        }
        last_position = Some(position);

        if summary.outcome != RunOutcome::BudgetExhausted {
            break;
        }
    }

    assert_eq!(outcomes.len(), 5);
    assert_eq!(outcomes.last(), Some(&RunOutcome::Exhausted));
    assert_eq!(emails(&sink), emails(&full_sink));

    // Each page fetched exactly once across the five invocations
    assert_eq!(driver.requests(), full_driver.requests());
    assert_eq!(sink.all_contacts().len(), 9);

    let stats = sink.load_stats(SOURCE).await.unwrap().unwrap();
    assert_eq!(stats.urls_visited, 5);
    assert_eq!(stats.contacts_found, 9);
    assert_eq!(stats.runs, 5);
}

#[tokio::test]
async fn test_rerun_against_unchanged_site_adds_nothing() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    two_category_site(&driver);
    harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    harvester.reset(SOURCE, false, true).await.unwrap();
    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.contacts_found, 0);
    assert_eq!(summary.duplicates, 9);
    assert_eq!(sink.all_contacts().len(), 9);
}

#[tokio::test]
async fn test_scenario_budget_of_three() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    driver.page(&page_url("A", 0), member_page(&["ann@smithlaw.com", "bob@smithlaw.com"], true));
    driver.page(&page_url("A", 1), broken_page());
    driver.page(&page_url("B", 0), member_page(&["ann@smithlaw.com", "cy@jonesllp.com"], true));

    let options = RunOptions {
        max_urls: 3,
        dry_run: false,
    };
    let summary = harvester.run_source(SOURCE, options, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(summary.urls_visited, 3);
    assert_eq!(summary.contacts_found, 3);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.structural_mismatches, 1);
    assert_eq!(sink.all_contacts().len(), 3);

    let stats = sink.load_stats(SOURCE).await.unwrap().unwrap();
    assert_eq!(stats.urls_visited, 3);
    assert_eq!(stats.contacts_found, 3);
    assert_eq!(stats.consecutive_empty_urls, 0);
    assert_eq!(stats.circuit_state, CircuitState::Active);

    let cursor = sink.load_cursor(SOURCE).await.unwrap().unwrap();
    assert_eq!(cursor.completed_category_codes, vec!["A"]);
    assert_eq!(cursor.category_code.as_deref(), Some("B"));
    assert_eq!(cursor.pages_completed, 1);
    assert_eq!(cursor.current_offset, 2);
}

#[tokio::test]
async fn test_unproductive_source_trips_across_runs() {
    let categories: Vec<String> = (0..20).map(|i| format!("c{:02}", i)).collect();
    let refs: Vec<&str> = categories.iter().map(String::as_str).collect();
    let (sink, driver, harvester) = setup(&refs).await;
    for category in &categories {
        driver.page(&page_url(category, 0), broken_page());
    }

    // Contacts from an earlier, differently shaped crawl of the source
    let stale = CandidateRecord {
        source_id: SOURCE.to_string(),
        ..Default::default()
    };
    sink.insert_batch(&[stale.into_contact("old@stale.com".to_string())]).await.unwrap();

    let five = RunOptions {
        max_urls: 5,
        dry_run: false,
    };
    let first = harvester.run_source(SOURCE, five, &CancellationToken::new()).await.unwrap();
    let second = harvester.run_source(SOURCE, five, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(second.outcome, RunOutcome::BudgetExhausted);

    let third = harvester.run_source(SOURCE, five, &CancellationToken::new()).await.unwrap();
    assert_eq!(third.outcome, RunOutcome::CircuitTripped);
    assert!(third.circuit_tripped);
    assert_eq!(third.purged, 1);
    assert_eq!(sink.count_contacts(SOURCE).await.unwrap(), 0);

    let stats = sink.load_stats(SOURCE).await.unwrap().unwrap();
    assert_eq!(stats.urls_visited, 15);
    assert_eq!(stats.consecutive_empty_urls, 15);
    assert!(stats.is_tripped());
    assert!(!harvester.registry().get(SOURCE).await.unwrap().is_productive());

    // Tripped sources cost no further fetches
    let fetched = driver.request_count();
    let fourth = harvester.run_source(SOURCE, five, &CancellationToken::new()).await.unwrap();
    assert_eq!(fourth.outcome, RunOutcome::SkippedTripped);
    assert_eq!(driver.request_count(), fetched);

    // Operator reset re-enables the source where it stopped
    harvester.reset(SOURCE, true, false).await.unwrap();
    let fifth = harvester
        .run_source(SOURCE, RunOptions { max_urls: 1, dry_run: false }, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fifth.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(driver.requests().last(), Some(&page_url("c15", 0)));
}

#[tokio::test]
async fn test_block_ends_run_after_processed_pages() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    driver.page(&page_url("A", 0), member_page(&["a1@smithlaw.com"], true));
    driver.page(&page_url("A", 1), member_page(&["a2@smithlaw.com"], true));
    driver.fail(&page_url("A", 2), FetchError::Blocked("challenge marker 'cf-challenge'".to_string()));

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Blocked);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.urls_visited, 2);
    // Challenges are never retried
    assert_eq!(driver.request_count(), 3);

    let cursor = sink.load_cursor(SOURCE).await.unwrap().unwrap();
    assert_eq!(cursor.pages_completed, 2);
    assert_eq!(cursor.current_offset, 4);
    assert_eq!(sink.load_stats(SOURCE).await.unwrap().unwrap().urls_visited, 2);

    // Next run resumes at the blocked page
    driver.page(&page_url("A", 2), member_page(&["a3@smithlaw.com"], false));
    let resumed = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Exhausted);
    assert_eq!(resumed.contacts_found, 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    let url = page_url("A", 0);
    driver.queue(&url, Err(FetchError::Timeout));
    driver.queue(&url, Err(FetchError::Network("connection reset".to_string())));
    driver.page(&url, member_page(&["a1@smithlaw.com"], false));

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.network_errors, 2);
    assert_eq!(summary.contacts_found, 1);
    assert_eq!(driver.request_count(), 3);
    assert_eq!(emails(&sink).len(), 1);
}

#[tokio::test]
async fn test_http_error_retried_once_then_skipped() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    driver.fail(&page_url("A", 0), FetchError::HttpStatus(500));
    driver.page(&page_url("A", 1), member_page(&["a2@smithlaw.com"], false));
    driver.page(&page_url("B", 0), member_page(&["b1@lexgroup.com"], false));

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.http_errors, 2);
    assert_eq!(summary.urls_visited, 3);
    assert_eq!(summary.empty_urls, 1);
    assert_eq!(
        driver.requests(),
        vec![page_url("A", 0), page_url("A", 0), page_url("A", 1), page_url("B", 0)]
    );
    assert_eq!(emails(&sink).len(), 2);
}

#[tokio::test]
async fn test_failed_page_does_not_complete_category() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    driver.page(&page_url("A", 0), member_page(&["a1@smithlaw.com"], true));
    driver.fail(&page_url("A", 1), FetchError::Timeout);
    driver.page(&page_url("A", 2), member_page(&["a3@smithlaw.com"], false));
    driver.page(&page_url("B", 0), member_page(&["b1@lexgroup.com"], false));

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.network_errors, 4);
    assert_eq!(summary.urls_visited, 4);
    assert_eq!(summary.empty_urls, 1);
    assert_eq!(summary.contacts_found, 3);

    // Pages past the failing one are still walked
    let requests = driver.requests();
    assert_eq!(requests.iter().filter(|u| **u == page_url("A", 1)).count(), 4);
    assert!(requests.contains(&page_url("A", 2)));
    assert!(emails(&sink).contains("a3@smithlaw.com"));

    let stats = sink.load_stats(SOURCE).await.unwrap().unwrap();
    assert_eq!(stats.urls_visited, 4);
    assert_eq!(stats.consecutive_empty_urls, 0);
}

#[tokio::test]
async fn test_repeated_failures_pause_on_the_page() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    driver.page(&page_url("A", 0), member_page(&["a1@smithlaw.com"], true));
    driver.fail(&page_url("A", 1), FetchError::HttpStatus(500));
    driver.fail(&page_url("A", 2), FetchError::HttpStatus(503));

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Paused);
    assert_eq!(summary.urls_visited, 3);
    assert_eq!(summary.empty_urls, 2);

    let cursor = sink.load_cursor(SOURCE).await.unwrap().unwrap();
    assert!(!cursor.exhausted);
    assert!(cursor.completed_category_codes.is_empty());
    assert_eq!(cursor.category_code.as_deref(), Some("A"));
    assert_eq!(cursor.current_offset, 4);
    assert_eq!(cursor.failed_pages, 2);

    // The paused page is fetched again once the site recovers
    driver.page(&page_url("A", 2), member_page(&["a3@smithlaw.com"], false));
    let resumed = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Exhausted);
    assert_eq!(resumed.urls_visited, 1);
    assert_eq!(resumed.contacts_found, 1);
    assert_eq!(driver.requests().last(), Some(&page_url("A", 2)));
}

#[tokio::test]
async fn test_not_found_after_skipped_page_ends_category() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    driver.page(&page_url("A", 0), member_page(&["a1@smithlaw.com"], true));
    driver.fail(&page_url("A", 1), FetchError::HttpStatus(500));
    // A?start=4 is not scripted and answers 404
    driver.page(&page_url("B", 0), member_page(&["b1@lexgroup.com"], false));

    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.urls_visited, 4);
    let cursor = sink.load_cursor(SOURCE).await.unwrap().unwrap();
    assert_eq!(cursor.completed_category_codes, vec!["A", "B"]);
    assert_eq!(emails(&sink).len(), 2);
}

#[tokio::test]
async fn test_browser_source_without_browser_is_a_config_error() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    two_category_site(&driver);
    driver.disable_browser();

    let mut rendered = directory_pattern(&[]);
    rendered.source_id = "spa_dir".to_string();
    rendered.list_url = "https://spa.test/members?start={offset}".to_string();
    rendered.render_js = true;
    harvester.registry().put(rendered).await.unwrap();

    let err = harvester
        .run_source("spa_dir", unbounded(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::InvalidConfig(_)));
    assert!(sink.load_cursor("spa_dir").await.unwrap().is_none());
    assert_eq!(driver.request_count(), 0);

    // Other sources still run
    let summaries = harvester.run_all(unbounded(), &CancellationToken::new()).await.unwrap();
    let ids: Vec<&str> = summaries.iter().map(|s| s.source_id.as_str()).collect();
    assert_eq!(ids, vec![SOURCE]);
    assert!(driver.requests().iter().all(|u| u.starts_with("https://dir.test/A")));
}

#[tokio::test]
async fn test_rows_without_email_count_as_empty() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    driver.page(&page_url("A", 0), no_email_page(2, true));
    driver.page(&page_url("A", 1), no_email_page(2, true));

    let options = RunOptions {
        max_urls: 2,
        dry_run: false,
    };
    let summary = harvester.run_source(SOURCE, options, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.empty_urls, 2);
    assert_eq!(summary.invalid, 4);
    assert_eq!(summary.contacts_found, 0);

    let stats = sink.load_stats(SOURCE).await.unwrap().unwrap();
    assert_eq!(stats.consecutive_empty_urls, 2);
    assert_eq!(stats.contacts_found, 0);
}

#[tokio::test]
async fn test_refetched_page_after_crash_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let driver = ScriptedDriver::new();
    two_category_site(&driver);
    let one_page = RunOptions {
        max_urls: 1,
        dry_run: false,
    };

    {
        let sink: Arc<dyn PersistenceSink> = Arc::new(FileSink::open(dir.path()).await.unwrap());
        let harvester = harvester(sink, driver.clone());
        harvester.registry().put(directory_pattern(&["A"])).await.unwrap();
        let first = harvester.run_source(SOURCE, one_page, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.contacts_found, 2);
    }

    // Process died after page two's contacts hit the log, before its cursor did
    let log = dir.path().join("contacts.jsonl");
    let mut content = std::fs::read_to_string(&log).unwrap();
    for email in ["a3@jonesllp.com", "a4@jonesllp.com"] {
        let contact = CandidateRecord {
            source_id: SOURCE.to_string(),
            ..Default::default()
        }
        .into_contact(email.to_string());
        content.push_str(&serde_json::to_string(&contact).unwrap());
        content.push('\n');
    }
    std::fs::write(&log, content).unwrap();

    let sink: Arc<dyn PersistenceSink> = Arc::new(FileSink::open(dir.path()).await.unwrap());
    let harvester = harvester(sink.clone(), driver.clone());
    let second = harvester.run_source(SOURCE, one_page, &CancellationToken::new()).await.unwrap();

    assert_eq!(second.contacts_found, 2);
    assert_eq!(second.duplicates, 0);
    assert_eq!(driver.requests()[1], page_url("A", 1));

    let stats = sink.load_stats(SOURCE).await.unwrap().unwrap();
    assert_eq!(stats.contacts_found, 4);
    assert_eq!(sink.count_contacts(SOURCE).await.unwrap(), 4);
}

#[tokio::test]
async fn test_persistence_failure_keeps_cursor() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    two_category_site(&driver);
    sink.set_fail_writes(true);

    let err = harvester
        .run_source(SOURCE, unbounded(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Persistence(_)));
    assert_eq!(driver.request_count(), 1);

    sink.set_fail_writes(false);
    assert!(sink.load_cursor(SOURCE).await.unwrap().is_none());
    assert!(sink.all_contacts().is_empty());

    // The failed page is fetched again on the next run
    let summary = harvester.run_source(SOURCE, unbounded(), &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.contacts_found, 5);
    assert_eq!(driver.requests()[1], page_url("A", 0));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    two_category_site(&driver);

    let options = RunOptions {
        max_urls: 1000,
        dry_run: true,
    };
    let summary = harvester.run_source(SOURCE, options, &CancellationToken::new()).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.contacts_found, 9);
    assert!(sink.all_contacts().is_empty());
    assert!(sink.load_cursor(SOURCE).await.unwrap().is_none());
    assert!(sink.load_stats(SOURCE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_run_fetches_nothing() {
    let (sink, driver, harvester) = setup(&["A"]).await;
    two_category_site(&driver);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = harvester.run_source(SOURCE, unbounded(), &cancel).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(driver.request_count(), 0);
    assert!(sink.load_cursor(SOURCE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_all_walks_every_source() {
    let (sink, driver, harvester) = setup(&["A", "B"]).await;
    two_category_site(&driver);

    let mut second = directory_pattern(&[]);
    second.source_id = "acme_dir".to_string();
    second.list_url = "https://acme.test/members?start={offset}".to_string();
    harvester.registry().put(second).await.unwrap();
    driver.page(
        "https://acme.test/members?start=0",
        member_page(&["x1@acme.com", "a1@smithlaw.com"], false),
    );

    let summaries = harvester.run_all(unbounded(), &CancellationToken::new()).await.unwrap();

    let ids: Vec<&str> = summaries.iter().map(|s| s.source_id.as_str()).collect();
    assert_eq!(ids, vec!["acme_dir", SOURCE]);
    assert!(summaries.iter().all(|s| s.outcome == RunOutcome::Exhausted));
    // The shared address belongs to whichever source found it first
    assert_eq!(summaries[1].duplicates, 1);
    assert_eq!(emails(&sink).len(), 10);
}

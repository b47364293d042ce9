//! Shared fixtures: a scripted page driver and a small directory site

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use contact_harvester::dedup::DomainBlocklist;
use contact_harvester::driver::{FetchOptions, PageDriver, RenderedPage, WidgetAction};
use contact_harvester::harvester::{Harvester, HarvesterSettings, RetryPolicy};
use contact_harvester::notifier::NoopNotifier;
use contact_harvester::pattern::{FieldSelectors, PaginationStrategy, PatternEntry, SelectorSpec};
use contact_harvester::rate_limiter::DelayProfile;
use contact_harvester::store::PersistenceSink;
use contact_harvester::FetchError;

pub const SOURCE: &str = "bar_test";

/// Serves canned responses per URL and records every request.
///
/// A URL answers from its queue first; once drained, the sticky response
/// is repeated. Unknown URLs answer 404.
#[derive(Default)]
pub struct ScriptedDriver {
    sticky: Mutex<HashMap<String, Result<String, FetchError>>>,
    queued: Mutex<HashMap<String, VecDeque<Result<String, FetchError>>>>,
    requests: Mutex<Vec<String>>,
    no_browser: AtomicBool,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn page(&self, url: &str, html: String) {
        self.sticky.lock().insert(url.to_string(), Ok(html));
    }

    pub fn fail(&self, url: &str, error: FetchError) {
        self.sticky.lock().insert(url.to_string(), Err(error));
    }

    /// One-shot response served before the sticky one
    pub fn queue(&self, url: &str, response: Result<String, FetchError>) {
        self.queued.lock().entry(url.to_string()).or_default().push_back(response);
    }

    /// Behave like a plain HTTP driver with no browser behind it
    pub fn disable_browser(&self) {
        self.no_browser.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn respond(&self, url: &str) -> Result<RenderedPage, FetchError> {
        self.requests.lock().push(url.to_string());
        let queued = self.queued.lock().get_mut(url).and_then(|q| q.pop_front());
        let response = match queued {
            Some(r) => r,
            None => self
                .sticky
                .lock()
                .get(url)
                .cloned()
                .unwrap_or(Err(FetchError::HttpStatus(404))),
        };
        response.map(|html| RenderedPage::new(url, html))
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn renders_js(&self) -> bool {
        !self.no_browser.load(Ordering::SeqCst)
    }

    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<RenderedPage, FetchError> {
        self.respond(url)
    }

    async fn interact(
        &self,
        url: &str,
        _actions: &[WidgetAction],
        _options: &FetchOptions,
    ) -> Result<RenderedPage, FetchError> {
        self.respond(url)
    }
}

/// Offset-paginated directory: `https://dir.test/{category}?start={offset}`
pub fn directory_pattern(categories: &[&str]) -> PatternEntry {
    PatternEntry {
        source_id: SOURCE.to_string(),
        display_name: "Test Bar Directory".to_string(),
        list_url: "https://dir.test/{category}?start={offset}".to_string(),
        render_js: false,
        pagination: PaginationStrategy::OffsetBased {
            offset_param: None,
            page_size: 2,
            start_offset: 0,
            next_selector: Some("a.next".to_string()),
        },
        fields: FieldSelectors {
            record: "li.member".to_string(),
            email: Some(SelectorSpec::attr("a.email", "href")),
            full_name: Some(SelectorSpec::text("span.name")),
            company: Some(SelectorSpec::text("span.firm")),
            source_ref: Some(SelectorSpec::attr("a.profile", "href")),
            ..Default::default()
        },
        categories: categories.iter().map(|c| c.to_string()).collect(),
        rate_limit: None,
        wait_for: None,
        non_productive: None,
        updated_at: None,
    }
}

/// URL of the `page`-th (zero-based) list page of `category`
pub fn page_url(category: &str, page: u64) -> String {
    format!("https://dir.test/{}?start={}", category, page * 2)
}

/// List page with one member per e-mail
pub fn member_page(emails: &[&str], has_next: bool) -> String {
    let members: String = emails
        .iter()
        .enumerate()
        .map(|(i, email)| {
            format!(
                r#"<li class="member">
                     <span class="name">Member {i}</span>
                     <span class="firm">Firm {i} LLP</span>
                     <a class="email" href="mailto:{email}">{email}</a>
                     <a class="profile" href="/profile/{i}?utm_source=list">Profile</a>
                   </li>"#
            )
        })
        .collect();
    let next = if has_next { r##"<a class="next" href="#">Next</a>"## } else { "" };
    format!("<html><body><ul>{members}</ul>{next}</body></html>")
}

/// List page whose member rows carry a name but no e-mail
pub fn no_email_page(rows: usize, has_next: bool) -> String {
    let members: String = (0..rows)
        .map(|i| format!(r#"<li class="member"><span class="name">Member {i}</span></li>"#))
        .collect();
    let next = if has_next { r##"<a class="next" href="#">Next</a>"## } else { "" };
    format!("<html><body><ul>{members}</ul>{next}</body></html>")
}

/// Page whose layout no longer matches the record selector
pub fn broken_page() -> String {
    "<html><body><div class=\"maintenance\">Back soon</div></body></html>".to_string()
}

/// Zero politeness delay and near-instant retries
pub fn fast_settings() -> HarvesterSettings {
    HarvesterSettings {
        delays: DelayProfile::from_millis(0, 0),
        retry: RetryPolicy {
            transient_retries: 3,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
        },
        ..Default::default()
    }
}

pub fn harvester(sink: Arc<dyn PersistenceSink>, driver: Arc<ScriptedDriver>) -> Harvester {
    Harvester::new("test-run", sink, driver, DomainBlocklist::default(), fast_settings())
        .with_notifier(Box::new(NoopNotifier))
}

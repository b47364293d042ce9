//! Page Driver
//!
//! Thin abstraction over whatever renders a page: plain HTTP for static
//! directories, a headless browser (Browserless) for SPA content and for
//! sources that paginate through stateful widgets.
//!
//! Drivers never retry; retry policy belongs to the orchestrator.

pub mod browserless;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;

pub use browserless::BrowserlessPageDriver;
pub use http::HttpPageDriver;

/// Markers of an explicit bot challenge in a response body
pub const DEFAULT_CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "cf-chl-",
    "challenge-platform",
    "captcha-delivery",
    "px-captcha",
    "are you a robot",
    "unusual traffic from your computer",
    "attention required! | cloudflare",
    "please verify you are a human",
];

/// One step of a widget interaction, executed in order on a fresh page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetAction {
    /// Choose `value` in a `<select>`
    Select { selector: String, value: String },
    Click { selector: String },
    WaitFor { selector: String },
}

/// What to load for one list page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Navigate { url: String },
    Interactive { url: String, actions: Vec<WidgetAction> },
}

impl PageRequest {
    pub fn url(&self) -> &str {
        match self {
            PageRequest::Navigate { url } | PageRequest::Interactive { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Page needs JavaScript execution before extraction
    pub render_js: bool,
    pub timeout: Duration,
    /// Selector to wait for before capturing the DOM (browser only)
    pub wait_for: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            render_js: false,
            timeout: Duration::from_secs(20),
            wait_for: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// URL that was requested
    pub url: String,
    /// URL after redirects / widget navigation
    pub final_url: String,
    pub status: u16,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

impl RenderedPage {
    pub fn new(url: &str, html: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            html: html.into(),
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &str;

    /// Can execute JavaScript and widget interactions
    fn renders_js(&self) -> bool {
        false
    }

    /// Loads `url` and returns its (optionally rendered) content
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<RenderedPage, FetchError>;

    /// Loads `url`, runs `actions` in order, and returns the resulting DOM
    async fn interact(
        &self,
        url: &str,
        actions: &[WidgetAction],
        options: &FetchOptions,
    ) -> Result<RenderedPage, FetchError>;
}

/// Loads a page request, bounded by its timeout and abandoned on cancel.
///
/// Returns `None` when `cancel` fired before the page was ready.
pub async fn load_page(
    driver: &dyn PageDriver,
    request: &PageRequest,
    options: &FetchOptions,
    cancel: &CancellationToken,
) -> Option<Result<RenderedPage, FetchError>> {
    let (deadline, fut) = match request {
        PageRequest::Navigate { url } => (
            options.timeout + Duration::from_secs(1),
            driver.fetch(url, options),
        ),
        PageRequest::Interactive { url, actions } => (
            // Each replayed step may wait up to the per-step timeout
            options.timeout * (actions.len() as u32 + 1),
            driver.interact(url, actions, options),
        ),
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(url = %request.url(), "Fetch abandoned on cancellation");
            None
        }
        res = tokio::time::timeout(deadline, fut) => {
            Some(res.unwrap_or(Err(FetchError::Timeout)))
        }
    }
}

/// Classifies responses into success, HTTP error, or bot challenge
pub struct BlockDetector {
    markers: Vec<String>,
    status_streak_threshold: u32,
    streak: AtomicU32,
}

impl BlockDetector {
    pub fn new(markers: &[String], status_streak_threshold: u32) -> Self {
        let markers = if markers.is_empty() {
            DEFAULT_CHALLENGE_MARKERS.iter().map(|m| m.to_string()).collect()
        } else {
            markers.iter().map(|m| m.to_lowercase()).collect()
        };
        Self {
            markers,
            status_streak_threshold: status_streak_threshold.max(1),
            streak: AtomicU32::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&[], 2)
    }

    /// `Ok(())` when the response is usable content
    pub fn classify(&self, status: u16, body: &str) -> Result<(), FetchError> {
        let lowered = body.to_lowercase();
        if let Some(marker) = self.markers.iter().find(|m| lowered.contains(m.as_str())) {
            warn!(status, marker = %marker, "Challenge marker detected");
            return Err(FetchError::Blocked(format!("challenge marker '{}'", marker)));
        }

        if status == 403 || status == 429 {
            let streak = self.streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= self.status_streak_threshold {
                warn!(status, streak, "Refusal streak reached block threshold");
                return Err(FetchError::Blocked(format!("HTTP {} streak of {}", status, streak)));
            }
            return Err(FetchError::HttpStatus(status));
        }

        self.streak.store(0, Ordering::Relaxed);
        if !(200..300).contains(&status) {
            return Err(FetchError::HttpStatus(status));
        }
        Ok(())
    }
}

/// Sends rendering and widget work to the browser, the rest over plain HTTP
pub struct RoutingPageDriver {
    http: Arc<dyn PageDriver>,
    browser: Option<Arc<dyn PageDriver>>,
}

impl RoutingPageDriver {
    pub fn new(http: Arc<dyn PageDriver>, browser: Option<Arc<dyn PageDriver>>) -> Self {
        Self { http, browser }
    }

    /// Callers check `renders_js` first; reaching the error means a
    /// browser-only request slipped past that check
    fn browser(&self) -> Result<&Arc<dyn PageDriver>, FetchError> {
        self.browser
            .as_ref()
            .ok_or_else(|| FetchError::Network("no browser driver configured (set BROWSERLESS_URL)".to_string()))
    }
}

#[async_trait]
impl PageDriver for RoutingPageDriver {
    fn name(&self) -> &str {
        "routing"
    }

    fn renders_js(&self) -> bool {
        self.browser.is_some()
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<RenderedPage, FetchError> {
        if options.render_js {
            self.browser()?.fetch(url, options).await
        } else {
            self.http.fetch(url, options).await
        }
    }

    async fn interact(
        &self,
        url: &str,
        actions: &[WidgetAction],
        options: &FetchOptions,
    ) -> Result<RenderedPage, FetchError> {
        self.browser()?.interact(url, actions, options).await
    }
}

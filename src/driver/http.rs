//! Plain HTTP Page Driver
//!
//! Fetches static HTML with a browser-like request profile. Does not
//! execute JavaScript and cannot drive widgets; those requests are routed
//! to the browser driver.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{BlockDetector, FetchOptions, PageDriver, RenderedPage, WidgetAction};
use crate::error::{FetchError, HarvestError, Result};

/// Configuration for the HTTP driver
#[derive(Debug, Clone)]
pub struct HttpDriverConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub challenge_markers: Vec<String>,
    pub block_status_streak: u32,
}

impl Default for HttpDriverConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("contact-harvester/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 5,
            challenge_markers: Vec::new(),
            block_status_streak: 2,
        }
    }
}

pub struct HttpPageDriver {
    client: Client,
    detector: BlockDetector,
}

impl HttpPageDriver {
    pub fn new(config: HttpDriverConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(HarvestError::HttpError)?;

        Ok(Self {
            client,
            detector: BlockDetector::new(&config.challenge_markers, config.block_status_streak),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(HttpDriverConfig::default())
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> std::result::Result<RenderedPage, FetchError> {
        if options.render_js {
            return Err(FetchError::Network(
                "plain HTTP driver cannot render JavaScript".to_string(),
            ));
        }

        debug!(url = %url, "Fetching page over HTTP");

        let response = self
            .client
            .get(url)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(FetchError::from)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let html = response.text().await.map_err(FetchError::from)?;

        self.detector.classify(status, &html)?;

        Ok(RenderedPage {
            url: url.to_string(),
            final_url,
            status,
            html,
            fetched_at: Utc::now(),
        })
    }

    async fn interact(
        &self,
        _url: &str,
        _actions: &[WidgetAction],
        _options: &FetchOptions,
    ) -> std::result::Result<RenderedPage, FetchError> {
        Err(FetchError::Network(
            "plain HTTP driver cannot drive page widgets".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(timeout_ms: u64) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<div class=\"row\">Ann</div>"))
            .mount(&server)
            .await;

        let driver = HttpPageDriver::with_defaults().unwrap();
        let url = format!("{}/directory", server.uri());
        let page = driver.fetch(&url, &options(2000)).await.unwrap();

        assert_eq!(page.status, 200);
        assert!(page.html.contains("Ann"));
    }

    #[tokio::test]
    async fn test_not_found_is_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let driver = HttpPageDriver::with_defaults().unwrap();
        let err = driver.fetch(&server.uri(), &options(2000)).await.unwrap_err();
        assert_eq!(err, FetchError::HttpStatus(404));
    }

    #[tokio::test]
    async fn test_forbidden_streak_becomes_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let driver = HttpPageDriver::with_defaults().unwrap();
        let first = driver.fetch(&server.uri(), &options(2000)).await.unwrap_err();
        let second = driver.fetch(&server.uri(), &options(2000)).await.unwrap_err();

        assert_eq!(first, FetchError::HttpStatus(403));
        assert!(matches!(second, FetchError::Blocked(_)));
    }

    #[tokio::test]
    async fn test_challenge_page_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<form id=\"challenge-form\"><div class=\"cf-challenge\"></div></form>"),
            )
            .mount(&server)
            .await;

        let driver = HttpPageDriver::with_defaults().unwrap();
        let err = driver.fetch(&server.uri(), &options(2000)).await.unwrap_err();
        assert!(matches!(err, FetchError::Blocked(_)));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let driver = HttpPageDriver::with_defaults().unwrap();
        let err = driver.fetch(&server.uri(), &options(50)).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
    }

    #[tokio::test]
    async fn test_render_js_rejected() {
        let driver = HttpPageDriver::with_defaults().unwrap();
        let opts = FetchOptions {
            render_js: true,
            ..Default::default()
        };
        let err = driver.fetch("http://127.0.0.1:1/", &opts).await.unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }
}

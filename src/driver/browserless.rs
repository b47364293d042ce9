//! Headless browser Page Driver backed by the Browserless HTTP API.
//!
//! `/content` returns the rendered DOM of a URL; `/function` runs a fixed
//! Puppeteer script that replays widget actions (select, click, wait) on
//! a fresh page and returns the resulting DOM.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{BlockDetector, FetchOptions, PageDriver, RenderedPage, WidgetAction};
use crate::error::{FetchError, HarvestError, Result};

/// Puppeteer function executed by `/function`
const INTERACT_FUNCTION: &str = r#"export default async function ({ page, context }) {
  const response = await page.goto(context.url, { waitUntil: "networkidle2", timeout: context.timeout });
  for (const action of context.actions) {
    if (action.type === "select") {
      await page.waitForSelector(action.selector, { timeout: context.timeout });
      await page.select(action.selector, action.value);
    } else if (action.type === "click") {
      await page.waitForSelector(action.selector, { timeout: context.timeout });
      await Promise.all([
        page.waitForNetworkIdle({ idleTime: 500, timeout: context.timeout }).catch(() => null),
        page.click(action.selector),
      ]);
    } else if (action.type === "wait_for") {
      await page.waitForSelector(action.selector, { timeout: context.timeout });
    }
  }
  if (context.waitFor) {
    await page.waitForSelector(context.waitFor, { timeout: context.timeout });
  }
  return {
    data: { status: response ? response.status() : 200, url: page.url(), html: await page.content() },
    type: "application/json",
  };
}"#;

#[derive(Debug, Deserialize)]
struct InteractResponse {
    status: u16,
    url: String,
    html: String,
}

pub struct BrowserlessPageDriver {
    client: Client,
    base_url: String,
    token: Option<String>,
    detector: BlockDetector,
}

impl BrowserlessPageDriver {
    pub fn new(base_url: &str, token: Option<&str>, detector: BlockDetector) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(HarvestError::HttpError)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            detector,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}/{}", self.base_url, path);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// Browserless failures: its own timeouts vs. everything else
    async fn api_error(resp: reqwest::Response) -> FetchError {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        if status == 408 || status == 504 || message.contains("TimeoutError") {
            FetchError::Timeout
        } else {
            FetchError::Network(format!("browserless returned {}: {}", status, message.trim()))
        }
    }
}

#[async_trait]
impl PageDriver for BrowserlessPageDriver {
    fn name(&self) -> &str {
        "browserless"
    }

    fn renders_js(&self) -> bool {
        true
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> std::result::Result<RenderedPage, FetchError> {
        let timeout_ms = options.timeout.as_millis() as u64;
        let mut body = json!({
            "url": url,
            "gotoOptions": { "waitUntil": "networkidle2", "timeout": timeout_ms },
        });
        if let Some(ref selector) = options.wait_for {
            body["waitForSelector"] = json!({ "selector": selector, "timeout": timeout_ms });
        }

        debug!(url = %url, "Fetching rendered page via Browserless");

        let resp = self
            .client
            .post(self.endpoint("content"))
            .timeout(options.timeout + Duration::from_secs(5))
            .json(&body)
            .send()
            .await
            .map_err(FetchError::from)?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        // Status of the target page, when Browserless reports it
        let status = resp
            .headers()
            .get("x-response-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(200);
        let html = resp.text().await.map_err(FetchError::from)?;

        self.detector.classify(status, &html)?;

        Ok(RenderedPage {
            url: url.to_string(),
            final_url: url.to_string(),
            status,
            html,
            fetched_at: Utc::now(),
        })
    }

    async fn interact(
        &self,
        url: &str,
        actions: &[WidgetAction],
        options: &FetchOptions,
    ) -> std::result::Result<RenderedPage, FetchError> {
        let body = json!({
            "code": INTERACT_FUNCTION,
            "context": {
                "url": url,
                "actions": actions,
                "timeout": options.timeout.as_millis() as u64,
                "waitFor": options.wait_for,
            },
        });

        debug!(url = %url, steps = actions.len(), "Replaying widget interaction via Browserless");

        let resp = self
            .client
            .post(self.endpoint("function"))
            .timeout(options.timeout * (actions.len() as u32 + 1))
            .json(&body)
            .send()
            .await
            .map_err(FetchError::from)?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let rendered: InteractResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Network(format!("malformed browserless response: {}", e)))?;

        self.detector.classify(rendered.status, &rendered.html)?;

        Ok(RenderedPage {
            url: url.to_string(),
            final_url: rendered.url,
            status: rendered.status,
            html: rendered.html,
            fetched_at: Utc::now(),
        })
    }
}

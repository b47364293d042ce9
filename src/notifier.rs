//! Run notifications
//!
//! Every run ends with a summary handed to a notifier. Delivery is best
//! effort: [`notify_quietly`] bounds it with a timeout and downgrades any
//! failure to a warning, so a dead webhook never fails a harvest.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::schemas::{RunOutcome, RunSummary};

/// Pluggable notification backend
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_run_summary(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Writes the summary to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_run_summary(&self, summary: &RunSummary) -> anyhow::Result<()> {
        info!(
            run_id = %summary.run_id,
            source = %summary.source_id,
            outcome = summary.outcome.as_str(),
            urls_visited = summary.urls_visited,
            contacts_found = summary.contacts_found,
            duplicates = summary.duplicates,
            invalid = summary.invalid,
            structural_mismatches = summary.structural_mismatches,
            http_errors = summary.http_errors,
            network_errors = summary.network_errors,
            blocked = summary.blocked,
            purged = summary.purged,
            duration_ms = summary.duration_ms,
            dry_run = summary.dry_run,
            "Run summary"
        );
        Ok(())
    }
}

/// No-op backend for tests
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_run_summary(&self, _summary: &RunSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

/// JSON POST of the summary to an incoming webhook
pub struct WebhookNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    fn headline(summary: &RunSummary) -> String {
        let verdict = match summary.outcome {
            RunOutcome::CircuitTripped => ":no_entry: circuit tripped",
            RunOutcome::Blocked => ":warning: blocked",
            RunOutcome::Paused => ":construction: paused on a failing page",
            RunOutcome::Cancelled => ":pause_button: cancelled",
            RunOutcome::Exhausted => ":checkered_flag: exhausted",
            RunOutcome::BudgetExhausted => ":hourglass: budget reached",
            RunOutcome::SkippedTripped => ":zzz: skipped (tripped)",
            RunOutcome::AlreadyExhausted => ":zzz: skipped (exhausted)",
        };
        format!(
            "*{}*: {}, {} new contacts from {} URLs",
            summary.source_id, verdict, summary.contacts_found, summary.urls_visited
        )
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_run_summary(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let payload = json!({
            "text": Self::headline(summary),
            "summary": summary,
        });

        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Webhook returned non-success");
            anyhow::bail!("webhook returned {status}");
        }

        Ok(())
    }
}

/// Backend from configuration: webhook if a URL is set, otherwise the log
pub fn from_config(webhook_url: Option<&str>) -> Box<dyn Notifier> {
    match webhook_url {
        Some(url) if !url.is_empty() => Box::new(WebhookNotifier::new(url.to_string())),
        _ => Box::new(LogNotifier),
    }
}

/// Fire-and-forget delivery bounded by `timeout`
pub async fn notify_quietly(notifier: &dyn Notifier, summary: &RunSummary, timeout: Duration) {
    match tokio::time::timeout(timeout, notifier.notify_run_summary(summary)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(source = %summary.source_id, error = %e, "Failed to deliver run summary"),
        Err(_) => warn!(source = %summary.source_id, "Run summary delivery timed out"),
    }
}

//! Configuration for the Contact Harvester

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::circuit_breaker::PurgePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Storage
    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub database_url: Option<String>,

    // Page driver
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_block_status_streak")]
    pub block_status_streak: u32,
    #[serde(default)]
    pub captcha_markers: Vec<String>,

    // Politeness (milliseconds)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    // Retries
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    // Run budget
    #[serde(default = "default_max_urls")]
    pub default_max_urls: u32,

    // Circuit breaker
    #[serde(default = "default_empty_threshold")]
    pub empty_threshold: u64,
    #[serde(default)]
    pub purge_policy: PurgePolicy,

    // Deduplication
    #[serde(default)]
    pub domain_blocklist: Vec<String>,
    pub domain_blocklist_file: Option<PathBuf>,

    // Notifications
    pub notify_webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub metrics_enabled: bool,
}

fn default_storage_type() -> String {
    "file".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/harvest")
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_request_timeout() -> u64 {
    20
}

fn default_block_status_streak() -> u32 {
    2
}

fn default_base_delay() -> u64 {
    1750
}

fn default_jitter() -> u64 {
    1000
}

fn default_transient_retries() -> u32 {
    3
}

fn default_retry_initial_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    15000
}

fn default_max_urls() -> u32 {
    100
}

fn default_empty_threshold() -> u64 {
    15
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            data_dir: default_data_dir(),
            database_url: None,
            browserless_url: None,
            browserless_token: None,
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
            block_status_streak: default_block_status_streak(),
            captcha_markers: Vec::new(),
            base_delay_ms: default_base_delay(),
            jitter_ms: default_jitter(),
            transient_retries: default_transient_retries(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            default_max_urls: default_max_urls(),
            empty_threshold: default_empty_threshold(),
            purge_policy: PurgePolicy::default(),
            domain_blocklist: Vec::new(),
            domain_blocklist_file: None,
            notify_webhook_url: None,
            notify_timeout_secs: default_notify_timeout(),
            metrics_port: default_metrics_port(),
            metrics_enabled: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        // Optional harvester.toml, overridden by environment
        let config = config::Config::builder()
            .add_source(config::File::with_name("harvester").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("domain_blocklist")
                    .with_list_parse_key("captcha_markers"),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        match self.storage_type.as_str() {
            "file" | "memory" => {}
            "postgres" => {
                if self.database_url.is_none() {
                    bail!("STORAGE_TYPE=postgres requires DATABASE_URL");
                }
            }
            other => bail!("Unknown storage type: {}", other),
        }
        if self.empty_threshold == 0 {
            bail!("EMPTY_THRESHOLD must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("REQUEST_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn has_browserless(&self) -> bool {
        self.browserless_url.is_some()
    }

    /// Blocklisted domains from both the inline list and the optional file
    pub fn load_domain_blocklist(&self) -> Result<Vec<String>> {
        let mut domains: Vec<String> = self
            .domain_blocklist
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        if let Some(ref path) = self.domain_blocklist_file {
            let contents = std::fs::read_to_string(path)?;
            domains.extend(parse_blocklist(&contents));
        }

        Ok(domains)
    }
}

/// One domain per line; `#` starts a comment
pub fn parse_blocklist(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim().to_lowercase())
        .filter(|line| !line.is_empty())
        .collect()
}

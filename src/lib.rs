//! Contact Harvester
//! Resumable multi-source contact harvesting from professional directories
//!
//! Features:
//! - Declarative per-source patterns (offset, token, and widget pagination)
//! - Plain HTTP and headless-browser page drivers with challenge detection
//! - Per-source politeness delays with jitter
//! - Corpus-wide e-mail deduplication and domain blocklist
//! - Resumable progress cursors saved atomically with source stats
//! - Cumulative circuit breaker that retires unproductive sources
//! - File, Postgres and in-memory persistence backends
//! - Run summaries via log or webhook, Prometheus metrics

pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod extractor;
pub mod harvester;
pub mod metrics;
pub mod notifier;
pub mod pattern;
pub mod progress;
pub mod rate_limiter;
pub mod schemas;
pub mod store;

pub use error::{FetchError, HarvestError, Result};
pub use harvester::{Harvester, HarvesterSettings, RunOptions};

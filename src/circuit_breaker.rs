//! Cumulative Circuit Breaker
//!
//! Decides when a source is not worth crawling any more. Evidence is the
//! source's persisted stats, so it accumulates across runs and processes:
//! a source that has cost `empty_threshold` URL visits without yielding a
//! single contact trips, and stays tripped until an operator resets it.
//!
//! States: Active -> Tripped (terminal without operator action)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::pattern::PatternRegistry;
use crate::schemas::{CircuitState, SourceStats};
use crate::store::PersistenceSink;

/// What happens to a tripped source's contacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgePolicy {
    /// Delete every contact of the source
    All,
    /// Delete only contacts no campaign has been sent to
    #[default]
    PreserveSent,
    /// Keep everything
    Disabled,
}

impl PurgePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgePolicy::All => "all",
            PurgePolicy::PreserveSent => "preserve_sent",
            PurgePolicy::Disabled => "disabled",
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Cumulative URL visits without any contact before tripping
    pub empty_threshold: u64,
    pub purge_policy: PurgePolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            empty_threshold: 15,
            purge_policy: PurgePolicy::PreserveSent,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    sink: Arc<dyn PersistenceSink>,
    registry: PatternRegistry,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, sink: Arc<dyn PersistenceSink>, registry: PatternRegistry) -> Self {
        Self { config, sink, registry }
    }

    /// Stored stats, or zeroed stats for a never-seen source
    pub async fn load_stats(&self, source_id: &str) -> Result<SourceStats> {
        Ok(self
            .sink
            .load_stats(source_id)
            .await?
            .unwrap_or_else(|| SourceStats::new(source_id)))
    }

    /// Merges one observation into the cumulative counters
    pub fn record(&self, stats: &mut SourceStats, urls_visited: u64, contacts_found: u64, empty: bool) {
        stats.urls_visited += urls_visited;
        stats.contacts_found += contacts_found;
        if empty {
            stats.consecutive_empty_urls += 1;
        } else {
            stats.consecutive_empty_urls = 0;
        }
        stats.updated_at = Some(Utc::now());

        debug!(
            circuit = %stats.source_id,
            urls_visited = stats.urls_visited,
            contacts_found = stats.contacts_found,
            consecutive_empty = stats.consecutive_empty_urls,
            "Recorded observation"
        );
    }

    /// Trip policy: enough cumulative visits and still no contact at all
    pub fn evaluate(&self, stats: &SourceStats) -> CircuitState {
        if stats.is_tripped()
            || (stats.urls_visited >= self.config.empty_threshold && stats.contacts_found == 0)
        {
            CircuitState::Tripped
        } else {
            CircuitState::Active
        }
    }

    /// Applies a trip: persists the tripped state, flags the pattern entry
    /// non-productive, then purges per policy. Returns contacts deleted.
    pub async fn trip(&self, stats: &mut SourceStats) -> Result<u64> {
        let source_id = stats.source_id.clone();
        stats.circuit_state = CircuitState::Tripped;
        stats.tripped_at = Some(Utc::now());
        stats.updated_at = stats.tripped_at;

        warn!(
            circuit = %source_id,
            urls_visited = stats.urls_visited,
            threshold = self.config.empty_threshold,
            "Circuit tripped: source is non-productive"
        );

        self.sink.save_stats(stats).await?;

        let reason = format!("{} URLs visited without a single contact", stats.urls_visited);
        match self.registry.mark_non_productive(&source_id, &reason, stats.urls_visited).await {
            Ok(()) => {}
            Err(HarvestError::PatternNotFound(_)) => {
                warn!(circuit = %source_id, "No pattern entry to mark non-productive");
            }
            Err(e) => return Err(e),
        }

        let purged = match self.config.purge_policy {
            PurgePolicy::Disabled => 0,
            PurgePolicy::All => self.sink.purge_source(&source_id, false).await?,
            PurgePolicy::PreserveSent => self.sink.purge_source(&source_id, true).await?,
        };

        info!(
            circuit = %source_id,
            policy = self.config.purge_policy.as_str(),
            purged,
            "Purged tripped source"
        );
        Ok(purged)
    }

    /// Operator override: zeroes stats and clears the non-productive mark
    pub async fn reset(&self, source_id: &str) -> Result<()> {
        let mut stats = self.load_stats(source_id).await?;
        let runs = stats.runs;
        stats = SourceStats::new(source_id);
        stats.runs = runs;
        stats.updated_at = Some(Utc::now());
        self.sink.save_stats(&stats).await?;

        match self.registry.clear_non_productive(source_id).await {
            Ok(()) | Err(HarvestError::PatternNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(circuit = %source_id, "Circuit reset to Active");
        Ok(())
    }
}

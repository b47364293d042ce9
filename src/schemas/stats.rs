//! Source Stats Schema
//!
//! Cumulative counters per source. Never reset by an individual run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted circuit state of a source
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Harvesting allowed
    #[default]
    Active,
    /// Source proved unproductive; never fetched again
    Tripped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub source_id: String,
    #[serde(default)]
    pub urls_visited: u64,
    #[serde(default)]
    pub contacts_found: u64,
    #[serde(default)]
    pub consecutive_empty_urls: u64,
    #[serde(default)]
    pub circuit_state: CircuitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_at: Option<DateTime<Utc>>,
    /// Invocations that fetched at least one page from this source
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceStats {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            urls_visited: 0,
            contacts_found: 0,
            consecutive_empty_urls: 0,
            circuit_state: CircuitState::Active,
            tripped_at: None,
            runs: 0,
            updated_at: None,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.circuit_state == CircuitState::Tripped
    }
}

//! Run Summary Schema
//!
//! End-of-run report handed to the notifier and printed by the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Why a run stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every category walked to the end during this run
    Exhausted,
    /// `maxUrls` reached; cursor saved for a later run
    BudgetExhausted,
    /// Circuit tripped during this run
    CircuitTripped,
    /// Anti-bot challenge detected; a later run may retry
    Blocked,
    /// A page kept failing; the cursor stays on it for a later run
    Paused,
    /// Circuit was already tripped; nothing fetched
    SkippedTripped,
    /// Cursor was already exhausted; nothing fetched
    AlreadyExhausted,
    /// Cancelled by signal or caller
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::BudgetExhausted => "budget_exhausted",
            RunOutcome::CircuitTripped => "circuit_tripped",
            RunOutcome::Blocked => "blocked",
            RunOutcome::Paused => "paused",
            RunOutcome::SkippedTripped => "skipped_tripped",
            RunOutcome::AlreadyExhausted => "already_exhausted",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub source_id: String,
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Pages processed in this run
    pub urls_visited: u64,
    /// New contacts admitted in this run
    pub contacts_found: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub empty_urls: u64,
    pub structural_mismatches: u64,
    pub http_errors: u64,
    pub network_errors: u64,
    pub blocked: u64,
    pub circuit_tripped: bool,
    /// Contacts removed by a trip purge
    pub purged: u64,
}

impl RunSummary {
    pub fn new(run_id: &str, source_id: &str, dry_run: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_id: source_id.to_string(),
            outcome: RunOutcome::Exhausted,
            dry_run,
            started_at: Utc::now(),
            duration_ms: 0,
            urls_visited: 0,
            contacts_found: 0,
            duplicates: 0,
            invalid: 0,
            empty_urls: 0,
            structural_mismatches: 0,
            http_errors: 0,
            network_errors: 0,
            blocked: 0,
            circuit_tripped: false,
            purged: 0,
        }
    }

    pub fn record_error(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::NetworkTransient => self.network_errors += 1,
            ErrorKind::HttpError => self.http_errors += 1,
            ErrorKind::BlockedSignal => self.blocked += 1,
            ErrorKind::StructuralMismatch => self.structural_mismatches += 1,
            ErrorKind::InvalidCandidate => self.invalid += 1,
            // Fatal: surfaces as an Err from the run instead
            ErrorKind::PersistenceFailure => {}
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
        self.circuit_tripped = outcome == RunOutcome::CircuitTripped;
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = elapsed.num_milliseconds().max(0) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_counts() {
        let mut summary = RunSummary::new("run", "s1", false);
        summary.record_error(ErrorKind::NetworkTransient);
        summary.record_error(ErrorKind::StructuralMismatch);
        summary.record_error(ErrorKind::StructuralMismatch);
        assert_eq!(summary.network_errors, 1);
        assert_eq!(summary.structural_mismatches, 2);
    }

    #[test]
    fn test_finish_sets_trip_flag() {
        let mut summary = RunSummary::new("run", "s1", false);
        summary.finish(RunOutcome::CircuitTripped);
        assert!(summary.circuit_tripped);
        assert_eq!(summary.outcome.as_str(), "circuit_tripped");
    }
}

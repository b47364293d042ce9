//! Error types for the Contact Harvester

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured failure of a single page fetch.
///
/// Returned by every [`PageDriver`](crate::driver::PageDriver). The
/// orchestrator decides retry vs. abort from the variant alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Blocked by anti-bot defenses: {0}")]
    Blocked(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Timeouts and connection-level failures are worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout | FetchError::Network(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout | FetchError::Network(_) => ErrorKind::NetworkTransient,
            FetchError::HttpStatus(_) => ErrorKind::HttpError,
            FetchError::Blocked(_) => ErrorKind::BlockedSignal,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus(status.as_u16())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Error taxonomy reported in run summaries and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTransient,
    HttpError,
    BlockedSignal,
    StructuralMismatch,
    PersistenceFailure,
    InvalidCandidate,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::HttpError => "http_error",
            ErrorKind::BlockedSignal => "blocked_signal",
            ErrorKind::StructuralMismatch => "structural_mismatch",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::InvalidCandidate => "invalid_candidate",
        }
    }
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("No pattern registered for source: {0}")]
    PatternNotFound(String),

    #[error("Invalid pattern for source {source_id}: {message}")]
    InvalidPattern { source_id: String, message: String },

    #[error("Run cancelled")]
    Cancelled,
}

impl HarvestError {
    pub fn invalid_pattern(source_id: &str, message: impl Into<String>) -> Self {
        HarvestError::InvalidPattern {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

//! Persistence Sink
//!
//! Everything the harvester keeps between runs: the contact corpus, one
//! progress cursor and one stats record per source, and the pattern
//! registry entries. Backends:
//! - `memory`: tests and dry experiments
//! - `file`: JSONL contact log plus an atomically replaced state file
//! - `postgres`: `sqlx` against the schema in `migrations/`

pub mod file;
pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{HarvestError, Result};
use crate::pattern::PatternEntry;
use crate::schemas::{ContactRecord, ProgressCursor, SourceStats};

pub use file::FileSink;
pub use memory::MemorySink;
pub use pg::PgSink;

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    async fn exists(&self, email: &str) -> Result<bool> {
        let found = self.exists_batch(&[email.to_string()]).await?;
        Ok(!found.is_empty())
    }

    /// Subset of `emails` already present in the corpus
    async fn exists_batch(&self, emails: &[String]) -> Result<HashSet<String>>;

    /// Appends contacts whose e-mail is not yet stored. Existing records
    /// are never overwritten. Returns the number inserted.
    async fn insert_batch(&self, contacts: &[ContactRecord]) -> Result<u64>;

    async fn count_contacts(&self, source_id: &str) -> Result<u64>;

    async fn list_contacts(&self, source_id: &str) -> Result<Vec<ContactRecord>>;

    /// Stamps `sent_at` on the given e-mails (downstream sender hook)
    async fn mark_sent(&self, emails: &[String], sent_at: DateTime<Utc>) -> Result<u64>;

    /// Deletes a source's contacts, keeping already-sent ones if asked.
    /// Returns the number deleted.
    async fn purge_source(&self, source_id: &str, preserve_sent: bool) -> Result<u64>;

    async fn load_cursor(&self, source_id: &str) -> Result<Option<ProgressCursor>>;

    async fn save_cursor(&self, cursor: &ProgressCursor) -> Result<()>;

    async fn load_stats(&self, source_id: &str) -> Result<Option<SourceStats>>;

    async fn save_stats(&self, stats: &SourceStats) -> Result<()>;

    /// Inserts one page's contacts and saves the source's cursor and stats
    /// as a single unit: after a crash either all of it is stored or none
    /// of it. Returns the number of contacts inserted.
    async fn commit_page(
        &self,
        contacts: &[ContactRecord],
        cursor: &ProgressCursor,
        stats: &SourceStats,
    ) -> Result<u64>;

    async fn load_pattern(&self, source_id: &str) -> Result<Option<PatternEntry>>;

    async fn save_pattern(&self, entry: &PatternEntry) -> Result<()>;

    async fn list_patterns(&self) -> Result<Vec<PatternEntry>>;
}

/// Builds the configured backend
pub async fn create_sink(config: &Config) -> Result<Arc<dyn PersistenceSink>> {
    let sink: Arc<dyn PersistenceSink> = match config.storage_type.as_str() {
        "memory" => Arc::new(MemorySink::new()),
        "file" => Arc::new(FileSink::open(&config.data_dir).await?),
        "postgres" => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| HarvestError::Persistence("DATABASE_URL is not set".to_string()))?;
            let sink = PgSink::connect(url).await?;
            sink.migrate().await?;
            Arc::new(sink)
        }
        other => {
            return Err(HarvestError::Persistence(format!("unknown storage type: {}", other)));
        }
    };

    info!(backend = sink.backend(), "Persistence sink ready");
    Ok(sink)
}

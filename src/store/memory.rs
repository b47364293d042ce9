//! In-memory sink for tests and ephemeral runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::PersistenceSink;
use crate::error::{HarvestError, Result};
use crate::pattern::PatternEntry;
use crate::schemas::{ContactRecord, ProgressCursor, SourceStats};

#[derive(Default)]
struct MemoryState {
    contacts: Vec<ContactRecord>,
    emails: HashSet<String>,
    cursors: HashMap<String, ProgressCursor>,
    stats: HashMap<String, SourceStats>,
    patterns: HashMap<String, PatternEntry>,
}

impl MemoryState {
    fn insert(&mut self, contacts: &[ContactRecord]) -> u64 {
        let mut inserted = 0;
        for contact in contacts {
            if self.emails.insert(contact.email.clone()) {
                self.contacts.push(contact.clone());
                inserted += 1;
            }
        }
        inserted
    }
}

#[derive(Default)]
pub struct MemorySink {
    state: RwLock<MemoryState>,
    /// Makes every write fail, for exercising persistence failures
    fail_writes: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HarvestError::Persistence("memory sink is failing writes".to_string()));
        }
        Ok(())
    }

    /// Every stored contact, in insertion order
    pub fn all_contacts(&self) -> Vec<ContactRecord> {
        self.state.read().contacts.clone()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn exists_batch(&self, emails: &[String]) -> Result<HashSet<String>> {
        let state = self.state.read();
        Ok(emails.iter().filter(|e| state.emails.contains(*e)).cloned().collect())
    }

    async fn insert_batch(&self, contacts: &[ContactRecord]) -> Result<u64> {
        self.check_writable()?;
        Ok(self.state.write().insert(contacts))
    }

    async fn count_contacts(&self, source_id: &str) -> Result<u64> {
        let state = self.state.read();
        Ok(state.contacts.iter().filter(|c| c.source_id == source_id).count() as u64)
    }

    async fn list_contacts(&self, source_id: &str) -> Result<Vec<ContactRecord>> {
        let state = self.state.read();
        Ok(state.contacts.iter().filter(|c| c.source_id == source_id).cloned().collect())
    }

    async fn mark_sent(&self, emails: &[String], sent_at: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let wanted: HashSet<&String> = emails.iter().collect();
        let mut state = self.state.write();
        let mut updated = 0;
        for contact in state.contacts.iter_mut().filter(|c| wanted.contains(&c.email)) {
            contact.sent_at = Some(sent_at);
            updated += 1;
        }
        Ok(updated)
    }

    async fn purge_source(&self, source_id: &str, preserve_sent: bool) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        let (purged, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.contacts)
            .into_iter()
            .partition(|c| c.source_id == source_id && !(preserve_sent && c.is_sent()));
        for contact in &purged {
            state.emails.remove(&contact.email);
        }
        state.contacts = kept;
        Ok(purged.len() as u64)
    }

    async fn load_cursor(&self, source_id: &str) -> Result<Option<ProgressCursor>> {
        Ok(self.state.read().cursors.get(source_id).cloned())
    }

    async fn save_cursor(&self, cursor: &ProgressCursor) -> Result<()> {
        self.check_writable()?;
        self.state.write().cursors.insert(cursor.source_id.clone(), cursor.clone());
        Ok(())
    }

    async fn load_stats(&self, source_id: &str) -> Result<Option<SourceStats>> {
        Ok(self.state.read().stats.get(source_id).cloned())
    }

    async fn save_stats(&self, stats: &SourceStats) -> Result<()> {
        self.check_writable()?;
        self.state.write().stats.insert(stats.source_id.clone(), stats.clone());
        Ok(())
    }

    async fn commit_page(
        &self,
        contacts: &[ContactRecord],
        cursor: &ProgressCursor,
        stats: &SourceStats,
    ) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.write();
        let inserted = state.insert(contacts);
        state.cursors.insert(cursor.source_id.clone(), cursor.clone());
        state.stats.insert(stats.source_id.clone(), stats.clone());
        Ok(inserted)
    }

    async fn load_pattern(&self, source_id: &str) -> Result<Option<PatternEntry>> {
        Ok(self.state.read().patterns.get(source_id).cloned())
    }

    async fn save_pattern(&self, entry: &PatternEntry) -> Result<()> {
        self.check_writable()?;
        self.state.write().patterns.insert(entry.source_id.clone(), entry.clone());
        Ok(())
    }

    async fn list_patterns(&self) -> Result<Vec<PatternEntry>> {
        Ok(self.state.read().patterns.values().cloned().collect())
    }
}

//! Filesystem sink
//!
//! Layout under the data directory:
//! - `contacts.jsonl`: append-only contact log, one JSON record per line
//! - `state.json`: cursors, stats and patterns, replaced atomically
//!   (temp file, fsync, rename) on every write
//!
//! `state.json` also records how many log lines are committed. A page is
//! committed by appending its contacts and then replacing the state, so
//! lines past the committed count belong to a page whose cursor never
//! reached disk; they are dropped on open and the page is fetched again.
//!
//! Single-process: concurrent harvester processes must use Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::PersistenceSink;
use crate::error::{HarvestError, Result};
use crate::pattern::PatternEntry;
use crate::schemas::{ContactRecord, ProgressCursor, SourceStats};

const STATE_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    version: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    cursors: HashMap<String, ProgressCursor>,
    #[serde(default)]
    stats: HashMap<String, SourceStats>,
    #[serde(default)]
    patterns: HashMap<String, PatternEntry>,
    /// Lines of `contacts.jsonl` covered by this state
    #[serde(default)]
    committed_contacts: Option<usize>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            updated_at: Utc::now(),
            cursors: HashMap::new(),
            stats: HashMap::new(),
            patterns: HashMap::new(),
            committed_contacts: None,
        }
    }
}

struct Inner {
    state: StateFile,
    contacts: Vec<ContactRecord>,
    emails: HashSet<String>,
}

pub struct FileSink {
    contacts_path: PathBuf,
    state_path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileSink {
    /// Opens (or creates) a store rooted at `dir`
    pub async fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await?;

        let contacts_path = dir.join("contacts.jsonl");
        let state_path = dir.join("state.json");

        let state = if fs::try_exists(&state_path).await? {
            let contents = fs::read_to_string(&state_path).await?;
            serde_json::from_str::<StateFile>(&contents).map_err(|e| {
                HarvestError::Persistence(format!("corrupt state file {}: {}", state_path.display(), e))
            })?
        } else {
            StateFile::default()
        };

        let contacts = if fs::try_exists(&contacts_path).await? {
            let (mut contacts, skipped) = read_contacts(&contacts_path).await?;
            let uncommitted = state
                .committed_contacts
                .map_or(0, |committed| contacts.len().saturating_sub(committed));
            if uncommitted > 0 {
                warn!(count = uncommitted, "Dropping contacts of a page that was never committed");
                contacts.truncate(contacts.len() - uncommitted);
            }
            if skipped > 0 || uncommitted > 0 {
                // Later appends must not land on a torn or uncommitted tail
                rewrite_log(&contacts_path, &contacts).await?;
            }
            contacts
        } else {
            Vec::new()
        };
        let emails = contacts.iter().map(|c| c.email.clone()).collect();

        info!(
            path = %dir.display(),
            contacts = contacts.len(),
            sources = state.cursors.len(),
            "Opened file store"
        );

        Ok(Self {
            contacts_path,
            state_path,
            inner: Mutex::new(Inner { state, contacts, emails }),
        })
    }

    async fn write_state(&self, state: &mut StateFile, committed_contacts: usize) -> Result<()> {
        state.updated_at = Utc::now();
        state.committed_contacts = Some(committed_contacts);
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_path, json.as_bytes()).await?;
        debug!(path = %self.state_path.display(), "State saved");
        Ok(())
    }

    async fn rewrite_contacts(&self, contacts: &[ContactRecord]) -> Result<()> {
        rewrite_log(&self.contacts_path, contacts).await
    }

    /// Appends to the contact log; returns the log length before the append
    async fn append_contacts(&self, contacts: &[ContactRecord]) -> Result<u64> {
        let buf = to_jsonl(contacts)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.contacts_path)
            .await?;
        let previous_len = file.metadata().await?.len();
        file.write_all(buf.as_bytes()).await?;
        file.sync_data().await?;
        debug!(count = contacts.len(), path = %self.contacts_path.display(), "Appended contacts");
        Ok(previous_len)
    }

    /// Appends `fresh` and then replaces the state with `state`, undoing
    /// the append when the state write fails
    async fn commit(&self, inner: &mut Inner, fresh: Vec<ContactRecord>, mut state: StateFile) -> Result<u64> {
        let previous_len = if fresh.is_empty() {
            None
        } else {
            Some(self.append_contacts(&fresh).await?)
        };

        let committed = inner.contacts.len() + fresh.len();
        if let Err(e) = self.write_state(&mut state, committed).await {
            if let Some(len) = previous_len {
                if let Err(truncate_err) = truncate_log(&self.contacts_path, len).await {
                    error!(error = %truncate_err, "Failed to roll back contact log");
                }
            }
            return Err(e);
        }

        let inserted = fresh.len() as u64;
        for contact in fresh {
            inner.emails.insert(contact.email.clone());
            inner.contacts.push(contact);
        }
        inner.state = state;
        Ok(inserted)
    }

    /// Saves a state change that touches no contacts
    async fn save_state(&self, update: impl FnOnce(&mut StateFile)) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut state = inner.state.clone();
        update(&mut state);
        self.write_state(&mut state, inner.contacts.len()).await?;
        inner.state = state;
        Ok(())
    }
}

/// Contacts not yet stored, first occurrence wins within the batch
fn fresh_contacts(inner: &Inner, contacts: &[ContactRecord]) -> Vec<ContactRecord> {
    let mut batch_emails = HashSet::new();
    contacts
        .iter()
        .filter(|c| !inner.emails.contains(&c.email) && batch_emails.insert(c.email.clone()))
        .cloned()
        .collect()
}

fn to_jsonl(contacts: &[ContactRecord]) -> Result<String> {
    let mut buf = String::new();
    for contact in contacts {
        buf.push_str(&serde_json::to_string(contact)?);
        buf.push('\n');
    }
    Ok(buf)
}

async fn rewrite_log(path: &Path, contacts: &[ContactRecord]) -> Result<()> {
    write_atomic(path, to_jsonl(contacts)?.as_bytes()).await
}

async fn truncate_log(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

/// Temp file, fsync, rename
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Parsed contacts plus the number of unreadable lines
async fn read_contacts(path: &Path) -> Result<(Vec<ContactRecord>, usize)> {
    let content = fs::read_to_string(path).await?;
    let mut contacts = Vec::new();
    let mut skipped = 0;
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ContactRecord>(line) {
            Ok(contact) => contacts.push(contact),
            // A torn final line from a crash mid-append
            Err(e) => {
                warn!(line = idx + 1, error = %e, "Skipping unreadable contact line");
                skipped += 1;
            }
        }
    }
    Ok((contacts, skipped))
}

#[async_trait]
impl PersistenceSink for FileSink {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn exists_batch(&self, emails: &[String]) -> Result<HashSet<String>> {
        let inner = self.inner.lock().await;
        Ok(emails.iter().filter(|e| inner.emails.contains(*e)).cloned().collect())
    }

    async fn insert_batch(&self, contacts: &[ContactRecord]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let fresh = fresh_contacts(&inner, contacts);
        if fresh.is_empty() {
            return Ok(0);
        }
        let state = inner.state.clone();
        self.commit(&mut inner, fresh, state).await
    }

    async fn commit_page(
        &self,
        contacts: &[ContactRecord],
        cursor: &ProgressCursor,
        stats: &SourceStats,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let fresh = fresh_contacts(&inner, contacts);
        let mut state = inner.state.clone();
        state.cursors.insert(cursor.source_id.clone(), cursor.clone());
        state.stats.insert(stats.source_id.clone(), stats.clone());
        self.commit(&mut inner, fresh, state).await
    }

    async fn count_contacts(&self, source_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.contacts.iter().filter(|c| c.source_id == source_id).count() as u64)
    }

    async fn list_contacts(&self, source_id: &str) -> Result<Vec<ContactRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.contacts.iter().filter(|c| c.source_id == source_id).cloned().collect())
    }

    async fn mark_sent(&self, emails: &[String], sent_at: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let wanted: HashSet<&String> = emails.iter().collect();

        let mut contacts = inner.contacts.clone();
        let mut updated = 0;
        for contact in contacts.iter_mut().filter(|c| wanted.contains(&c.email)) {
            contact.sent_at = Some(sent_at);
            updated += 1;
        }
        if updated > 0 {
            self.rewrite_contacts(&contacts).await?;
            inner.contacts = contacts;
        }
        Ok(updated)
    }

    async fn purge_source(&self, source_id: &str, preserve_sent: bool) -> Result<u64> {
        let mut inner = self.inner.lock().await;

        let (purged, kept): (Vec<_>, Vec<_>) = inner
            .contacts
            .iter()
            .cloned()
            .partition(|c| c.source_id == source_id && !(preserve_sent && c.is_sent()));
        if purged.is_empty() {
            return Ok(0);
        }

        self.rewrite_contacts(&kept).await?;
        for contact in &purged {
            inner.emails.remove(&contact.email);
        }
        inner.contacts = kept;

        let mut state = inner.state.clone();
        self.write_state(&mut state, inner.contacts.len()).await?;
        inner.state = state;
        Ok(purged.len() as u64)
    }

    async fn load_cursor(&self, source_id: &str) -> Result<Option<ProgressCursor>> {
        Ok(self.inner.lock().await.state.cursors.get(source_id).cloned())
    }

    async fn save_cursor(&self, cursor: &ProgressCursor) -> Result<()> {
        self.save_state(|state| {
            state.cursors.insert(cursor.source_id.clone(), cursor.clone());
        })
        .await
    }

    async fn load_stats(&self, source_id: &str) -> Result<Option<SourceStats>> {
        Ok(self.inner.lock().await.state.stats.get(source_id).cloned())
    }

    async fn save_stats(&self, stats: &SourceStats) -> Result<()> {
        self.save_state(|state| {
            state.stats.insert(stats.source_id.clone(), stats.clone());
        })
        .await
    }

    async fn load_pattern(&self, source_id: &str) -> Result<Option<PatternEntry>> {
        Ok(self.inner.lock().await.state.patterns.get(source_id).cloned())
    }

    async fn save_pattern(&self, entry: &PatternEntry) -> Result<()> {
        self.save_state(|state| {
            state.patterns.insert(entry.source_id.clone(), entry.clone());
        })
        .await
    }

    async fn list_patterns(&self) -> Result<Vec<PatternEntry>> {
        Ok(self.inner.lock().await.state.patterns.values().cloned().collect())
    }
}

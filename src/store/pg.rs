//! PostgreSQL sink
//!
//! Runtime-checked queries (no compile-time database needed). Schema
//! lives in `migrations/` and is applied by [`PgSink::migrate`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::PersistenceSink;
use crate::error::{HarvestError, Result};
use crate::pattern::PatternEntry;
use crate::schemas::{ContactRecord, ProgressCursor, SourceStats};

#[derive(sqlx::FromRow)]
struct ContactRow {
    email: String,
    source_id: String,
    first_name: String,
    last_name: String,
    company_or_firm: String,
    source_ref: String,
    discovered_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl From<ContactRow> for ContactRecord {
    fn from(row: ContactRow) -> Self {
        ContactRecord {
            source_id: row.source_id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            company_or_firm: row.company_or_firm,
            source_ref: row.source_ref,
            discovered_at: row.discovered_at,
            sent_at: row.sent_at,
        }
    }
}

#[derive(Clone)]
pub struct PgSink {
    db: PgPool,
}

impl PgSink {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let db = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { db })
    }

    /// Applies the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .map_err(|e| HarvestError::Persistence(format!("migration failed: {}", e)))?;
        Ok(())
    }
}

async fn insert_contacts<'e, E>(executor: E, contacts: &[ContactRecord]) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    if contacts.is_empty() {
        return Ok(0);
    }

    let mut emails = Vec::with_capacity(contacts.len());
    let mut sources = Vec::with_capacity(contacts.len());
    let mut first_names = Vec::with_capacity(contacts.len());
    let mut last_names = Vec::with_capacity(contacts.len());
    let mut companies = Vec::with_capacity(contacts.len());
    let mut refs = Vec::with_capacity(contacts.len());
    let mut discovered = Vec::with_capacity(contacts.len());
    for c in contacts {
        emails.push(c.email.clone());
        sources.push(c.source_id.clone());
        first_names.push(c.first_name.clone());
        last_names.push(c.last_name.clone());
        companies.push(c.company_or_firm.clone());
        refs.push(c.source_ref.clone());
        discovered.push(c.discovered_at);
    }

    // ON CONFLICT DO NOTHING: an existing (possibly sent) record is never touched
    let result = sqlx::query(
        r#"
        INSERT INTO contacts (email, source_id, first_name, last_name, company_or_firm, source_ref, discovered_at)
        SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], $7::timestamptz[])
        ON CONFLICT (email) DO NOTHING
        "#,
    )
    .bind(&emails)
    .bind(&sources)
    .bind(&first_names)
    .bind(&last_names)
    .bind(&companies)
    .bind(&refs)
    .bind(&discovered)
    .execute(executor)
    .await?;

    debug!(count = result.rows_affected(), "Inserted contacts");
    Ok(result.rows_affected())
}

async fn upsert_progress<'e, E>(executor: E, cursor: &ProgressCursor, stats: &SourceStats) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO harvest_state (source_id, cursor, stats, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (source_id) DO UPDATE SET
            cursor = EXCLUDED.cursor,
            stats = EXCLUDED.stats,
            updated_at = NOW()
        "#,
    )
    .bind(&cursor.source_id)
    .bind(Json(cursor))
    .bind(Json(stats))
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl PersistenceSink for PgSink {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn exists_batch(&self, emails: &[String]) -> Result<HashSet<String>> {
        let found: Vec<String> = sqlx::query_scalar("SELECT email FROM contacts WHERE email = ANY($1)")
            .bind(emails)
            .fetch_all(&self.db)
            .await?;
        Ok(found.into_iter().collect())
    }

    async fn insert_batch(&self, contacts: &[ContactRecord]) -> Result<u64> {
        insert_contacts(&self.db, contacts).await
    }

    async fn commit_page(
        &self,
        contacts: &[ContactRecord],
        cursor: &ProgressCursor,
        stats: &SourceStats,
    ) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let inserted = insert_contacts(&mut *tx, contacts).await?;
        upsert_progress(&mut *tx, cursor, stats).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn count_contacts(&self, source_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts WHERE source_id = $1")
            .bind(source_id)
            .fetch_one(&self.db)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_contacts(&self, source_id: &str) -> Result<Vec<ContactRecord>> {
        let rows: Vec<ContactRow> = sqlx::query_as(
            r#"
            SELECT email, source_id, first_name, last_name, company_or_firm, source_ref, discovered_at, sent_at
            FROM contacts
            WHERE source_id = $1
            ORDER BY discovered_at, email
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(ContactRecord::from).collect())
    }

    async fn mark_sent(&self, emails: &[String], sent_at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("UPDATE contacts SET sent_at = $2 WHERE email = ANY($1)")
            .bind(emails)
            .bind(sent_at)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_source(&self, source_id: &str, preserve_sent: bool) -> Result<u64> {
        let sql = if preserve_sent {
            "DELETE FROM contacts WHERE source_id = $1 AND sent_at IS NULL"
        } else {
            "DELETE FROM contacts WHERE source_id = $1"
        };
        let result = sqlx::query(sql).bind(source_id).execute(&self.db).await?;
        Ok(result.rows_affected())
    }

    async fn load_cursor(&self, source_id: &str) -> Result<Option<ProgressCursor>> {
        let cursor: Option<Option<Json<ProgressCursor>>> =
            sqlx::query_scalar("SELECT cursor FROM harvest_state WHERE source_id = $1")
                .bind(source_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(cursor.flatten().map(|Json(c)| c))
    }

    async fn save_cursor(&self, cursor: &ProgressCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvest_state (source_id, cursor, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source_id) DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = NOW()
            "#,
        )
        .bind(&cursor.source_id)
        .bind(Json(cursor))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_stats(&self, source_id: &str) -> Result<Option<SourceStats>> {
        let stats: Option<Option<Json<SourceStats>>> =
            sqlx::query_scalar("SELECT stats FROM harvest_state WHERE source_id = $1")
                .bind(source_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(stats.flatten().map(|Json(s)| s))
    }

    async fn save_stats(&self, stats: &SourceStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvest_state (source_id, stats, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source_id) DO UPDATE SET stats = EXCLUDED.stats, updated_at = NOW()
            "#,
        )
        .bind(&stats.source_id)
        .bind(Json(stats))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_pattern(&self, source_id: &str) -> Result<Option<PatternEntry>> {
        let entry: Option<Json<PatternEntry>> =
            sqlx::query_scalar("SELECT entry FROM source_patterns WHERE source_id = $1")
                .bind(source_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(entry.map(|Json(e)| e))
    }

    async fn save_pattern(&self, entry: &PatternEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_patterns (source_id, entry, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source_id) DO UPDATE SET entry = EXCLUDED.entry, updated_at = NOW()
            "#,
        )
        .bind(&entry.source_id)
        .bind(Json(entry))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_patterns(&self) -> Result<Vec<PatternEntry>> {
        let entries: Vec<Json<PatternEntry>> =
            sqlx::query_scalar("SELECT entry FROM source_patterns ORDER BY source_id")
                .fetch_all(&self.db)
                .await?;
        Ok(entries.into_iter().map(|Json(e)| e).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::CandidateRecord;

    // Needs a scratch database: DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_round_trip_against_postgres() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let sink = PgSink::connect(&url).await.unwrap();
        sink.migrate().await.unwrap();

        let source = format!("pg_test_{}", uuid::Uuid::new_v4().simple());
        let email = format!("{}@example.com", source);
        let contact = CandidateRecord {
            source_id: source.clone(),
            ..Default::default()
        }
        .into_contact(email.clone());

        let mut cursor = ProgressCursor::new(&source);
        cursor.pages_completed = 4;
        let stats = SourceStats::new(&source);
        assert_eq!(sink.commit_page(&[contact.clone()], &cursor, &stats).await.unwrap(), 1);
        assert_eq!(sink.insert_batch(&[contact]).await.unwrap(), 0);
        assert!(sink.exists(&email).await.unwrap());
        assert_eq!(sink.load_cursor(&source).await.unwrap(), Some(cursor));

        assert_eq!(sink.purge_source(&source, false).await.unwrap(), 1);
    }
}

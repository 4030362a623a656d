//! SQLite-backed [`KnowledgeStore`].
//!
//! Rows live in `knowledge_entries` (see [`crate::migrate`]). Timestamps are
//! stored as unix seconds. The partial unique index on `content_hash` for
//! active rows backs up the dedup decision made in [`super::plan_upsert`]:
//! if two processes race, the loser gets a
//! [`StoreError::ConstraintViolation`] instead of a second active copy.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db;
use crate::error::StoreError;
use crate::hash::ContentHash;
use crate::migrate;
use crate::models::{EntryCandidate, EntryFilter, EntryKey, KnowledgeEntry, SourceType};

use super::{plan_restores, plan_upsert, KnowledgeStore, StoreStats, UpsertOutcome, WriteKind};

macro_rules! select_entries {
    ($tail:literal) => {
        concat!(
            "SELECT id, source_type, source_url, title, content, content_hash, \
             last_updated, last_checked, is_active, deactivated_at, duplicate_of \
             FROM knowledge_entries ",
            $tail
        )
    };
}

pub struct SqliteStore {
    pool: SqlitePool,
    /// Serializes upserts from this process so the read-decide-write step
    /// never interleaves.
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Connect using `config.db` and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::ensure_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn entry_from_row(row: &SqliteRow) -> Result<KnowledgeEntry, StoreError> {
    let source_type: String = row.try_get("source_type")?;
    let source_type = source_type
        .parse::<SourceType>()
        .map_err(StoreError::Unavailable)?;
    let deactivated_at: Option<i64> = row.try_get("deactivated_at")?;

    Ok(KnowledgeEntry {
        id: row.try_get("id")?,
        source_type,
        source_url: row.try_get("source_url")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        content_hash: ContentHash::from_stored(row.try_get("content_hash")?),
        last_updated: from_ts(row.try_get("last_updated")?),
        last_checked: from_ts(row.try_get("last_checked")?),
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        deactivated_at: deactivated_at.map(from_ts),
        duplicate_of: row.try_get("duplicate_of")?,
    })
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn upsert(&self, candidate: &EntryCandidate) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing_row = match candidate.key() {
            EntryKey::Url(url) => {
                sqlx::query(select_entries!("WHERE source_url = ?"))
                    .bind(url)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            EntryKey::Manual(title) => {
                sqlx::query(select_entries!(
                    "WHERE (source_type = 'manual' OR source_url = '') AND title = ? \
                     ORDER BY is_active DESC, id LIMIT 1"
                ))
                .bind(title)
                .fetch_optional(&mut *tx)
                .await?
            }
        };
        let existing = existing_row.as_ref().map(entry_from_row).transpose()?;

        let holder_row = sqlx::query(select_entries!(
            "WHERE content_hash = ? AND is_active = 1 LIMIT 1"
        ))
        .bind(candidate.content_hash.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let holder = holder_row.as_ref().map(entry_from_row).transpose()?;

        let plan = plan_upsert(candidate, existing.as_ref(), holder.as_ref());
        let row = &plan.row;

        match plan.write {
            WriteKind::Touch => {
                sqlx::query("UPDATE knowledge_entries SET last_checked = ? WHERE id = ?")
                    .bind(row.last_checked.timestamp())
                    .bind(&row.id)
                    .execute(&mut *tx)
                    .await?;
            }
            WriteKind::Insert => {
                sqlx::query(
                    r#"
                    INSERT INTO knowledge_entries (id, source_type, source_url, title, content,
                                                   content_hash, last_updated, last_checked,
                                                   is_active, deactivated_at, duplicate_of)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&row.id)
                .bind(row.source_type.as_str())
                .bind(&row.source_url)
                .bind(&row.title)
                .bind(&row.content)
                .bind(row.content_hash.as_str())
                .bind(row.last_updated.timestamp())
                .bind(row.last_checked.timestamp())
                .bind(row.is_active as i64)
                .bind(row.deactivated_at.map(|t| t.timestamp()))
                .bind(&row.duplicate_of)
                .execute(&mut *tx)
                .await?;
            }
            WriteKind::Update => {
                sqlx::query(
                    r#"
                    UPDATE knowledge_entries SET
                        source_type = ?, source_url = ?, title = ?, content = ?,
                        content_hash = ?, last_updated = ?, last_checked = ?,
                        is_active = ?, deactivated_at = ?, duplicate_of = ?
                    WHERE id = ?
                    "#,
                )
                .bind(row.source_type.as_str())
                .bind(&row.source_url)
                .bind(&row.title)
                .bind(&row.content)
                .bind(row.content_hash.as_str())
                .bind(row.last_updated.timestamp())
                .bind(row.last_checked.timestamp())
                .bind(row.is_active as i64)
                .bind(row.deactivated_at.map(|t| t.timestamp()))
                .bind(&row.duplicate_of)
                .bind(&row.id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(plan.outcome)
    }

    async fn deactivate_missing(
        &self,
        seen_urls: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, source_url FROM knowledge_entries \
             WHERE is_active = 1 AND source_type IN ('page', 'pdf')",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut count = 0u64;
        for row in rows {
            let url: String = row.try_get("source_url")?;
            if seen_urls.contains(&url) {
                continue;
            }
            let id: String = row.try_get("id")?;
            sqlx::query(
                "UPDATE knowledge_entries SET is_active = 0, deactivated_at = ? WHERE id = ?",
            )
            .bind(now.timestamp())
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            count += 1;
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn restore_orphaned_duplicates(
        &self,
        seen_urls: &HashSet<String>,
    ) -> Result<Vec<String>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let holders: Vec<(String, String)> = sqlx::query_as(
            "SELECT content_hash, id FROM knowledge_entries WHERE is_active = 1",
        )
        .fetch_all(&mut *tx)
        .await?;
        let mut active_by_hash: HashMap<ContentHash, String> = holders
            .into_iter()
            .map(|(hash, id)| (ContentHash::from_stored(hash), id))
            .collect();

        let rows = sqlx::query(select_entries!(
            "WHERE is_active = 0 AND duplicate_of IS NOT NULL ORDER BY id"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let mut suppressed = Vec::new();
        for row in &rows {
            let entry = entry_from_row(row)?;
            if seen_urls.contains(&entry.source_url) {
                suppressed.push(entry);
            }
        }

        let mut restored = Vec::new();
        for row in plan_restores(&mut active_by_hash, suppressed) {
            sqlx::query(
                "UPDATE knowledge_entries SET is_active = ?, deactivated_at = ?, duplicate_of = ? \
                 WHERE id = ?",
            )
            .bind(row.is_active as i64)
            .bind(row.deactivated_at.map(|t| t.timestamp()))
            .bind(&row.duplicate_of)
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
            if row.is_active {
                restored.push(row.id);
            }
        }

        tx.commit().await?;
        Ok(restored)
    }

    fn list_active(&self, filter: EntryFilter) -> BoxStream<'_, Result<KnowledgeEntry, StoreError>> {
        sqlx::query(select_entries!(
            "WHERE is_active = 1 \
             AND (?1 IS NULL OR source_type = ?1) \
             AND (?2 IS NULL OR substr(source_url, 1, length(?2)) = ?2) \
             ORDER BY id"
        ))
        .bind(filter.source_type.map(|t| t.as_str()))
        .bind(filter.url_prefix)
        .fetch(&self.pool)
        .map(|row| {
            row.map_err(StoreError::from)
                .and_then(|row| entry_from_row(&row))
        })
        .boxed()
    }

    async fn compact(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = (now - retention).timestamp();
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM knowledge_entries WHERE is_active = 0 AND deactivated_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, StoreError> {
        let row = sqlx::query(select_entries!("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<KnowledgeEntry>, StoreError> {
        if url.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(select_entries!("WHERE source_url = ?"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ts: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(last_checked) FROM knowledge_entries \
             WHERE is_active = 1 AND source_type IN ('page', 'pdf')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ts.map(from_ts))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(is_active = 1), 0) AS active,
                COALESCE(SUM(is_active = 0), 0) AS inactive,
                COALESCE(SUM(is_active = 0 AND duplicate_of IS NOT NULL), 0) AS suppressed,
                COALESCE(SUM(is_active = 1 AND source_type = 'page'), 0) AS pages,
                COALESCE(SUM(is_active = 1 AND source_type = 'pdf'), 0) AS pdfs,
                COALESCE(SUM(is_active = 1 AND source_type = 'manual'), 0) AS manual
            FROM knowledge_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            active: row.try_get::<i64, _>("active")? as u64,
            inactive: row.try_get::<i64, _>("inactive")? as u64,
            suppressed_duplicates: row.try_get::<i64, _>("suppressed")? as u64,
            active_pages: row.try_get::<i64, _>("pages")? as u64,
            active_pdfs: row.try_get::<i64, _>("pdfs")? as u64,
            active_manual: row.try_get::<i64, _>("manual")? as u64,
            last_refresh: self.last_refresh().await?,
        })
    }
}

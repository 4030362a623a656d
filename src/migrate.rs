//! Schema creation. Every statement is create-if-absent; there are no
//! migrations beyond the initial tables.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// `kb init`: create the database file and all tables.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_entries (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL CHECK(source_type IN ('page', 'pdf', 'manual')),
            source_url TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            last_checked INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            deactivated_at INTEGER,
            duplicate_of TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // No two active entries may share content.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_active_hash \
         ON knowledge_entries(content_hash) WHERE is_active = 1",
    )
    .execute(pool)
    .await?;

    // One row per source URL; manual entries have an empty URL.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_source_url \
         ON knowledge_entries(source_url) WHERE source_url <> ''",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_manual_title \
         ON knowledge_entries(title) WHERE source_type = 'manual'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_inactive \
         ON knowledge_entries(deactivated_at) WHERE is_active = 0",
    )
    .execute(pool)
    .await?;

    // Owned by the chat front end; created here so one `kb init` prepares
    // the whole database.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            session_id TEXT PRIMARY KEY,
            user_id TEXT,
            created_at INTEGER NOT NULL,
            last_activity INTEGER NOT NULL,
            session_name TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            message_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            message_type TEXT NOT NULL CHECK(message_type IN ('user', 'assistant')),
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            tokens_used INTEGER,
            response_time REAL,
            FOREIGN KEY (session_id) REFERENCES chat_sessions(session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

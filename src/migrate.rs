use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Local replica of the primary note store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            template_id TEXT,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            fields_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT,
            modified_at TEXT NOT NULL,
            modified_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hash_ledger (
            index_kind TEXT NOT NULL,
            document_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            last_known_hash TEXT NOT NULL,
            last_synced_at INTEGER NOT NULL,
            last_known_status TEXT NOT NULL,
            PRIMARY KEY (index_kind, document_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only topic log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_messages (
            topic TEXT NOT NULL,
            msg_offset INTEGER NOT NULL,
            msg_key TEXT,
            payload BLOB NOT NULL,
            published_at INTEGER NOT NULL,
            PRIMARY KEY (topic, msg_offset)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Next offset to deliver per (topic, group)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_offsets (
            topic TEXT NOT NULL,
            group_name TEXT NOT NULL,
            next_offset INTEGER NOT NULL,
            PRIMARY KEY (topic, group_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notes_modified ON notes(modified_at_ms, id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_notes_owner ON notes(owner_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_hash_ledger_owner ON hash_ledger(index_kind, owner_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

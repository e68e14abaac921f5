//! SQLite-backed [`NoteStore`] and [`HashLedger`].
//!
//! The `notes` table is a local replica of the primary store: the engine
//! only reads it by window and id, and deletes by owner on withdrawal.
//! [`SqliteNoteStore::upsert`] exists for seeding and for tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use notesync_core::hash::ContentHash;
use notesync_core::models::HashLedgerEntry;
use notesync_core::store::{HashLedger, ModifiedKey, NoteStore};
use notesync_core::{IndexKind, NoteSnapshot, NoteStatus, SyncWindow};

/// SQLite's default bound-parameter limit is well above this.
const FETCH_CHUNK: usize = 500;

pub struct SqliteNoteStore {
    pool: SqlitePool,
}

impl SqliteNoteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a note.
    pub async fn upsert(&self, note: &NoteSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notes (id, owner_id, template_id, title, body, tags_json,
                               fields_json, status, created_at, modified_at, modified_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                template_id = excluded.template_id,
                title = excluded.title,
                body = excluded.body,
                tags_json = excluded.tags_json,
                fields_json = excluded.fields_json,
                status = excluded.status,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at,
                modified_at_ms = excluded.modified_at_ms
            "#,
        )
        .bind(&note.id)
        .bind(&note.owner_id)
        .bind(&note.template_id)
        .bind(&note.title)
        .bind(&note.body)
        .bind(serde_json::to_string(&note.tags)?)
        .bind(serde_json::to_string(&note.fields)?)
        .bind(note.status.as_str())
        .bind(note.created_at.map(|t| t.to_rfc3339()))
        .bind(note.modified_at.to_rfc3339())
        .bind(note.modified_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert note {}", note.id))?;
        Ok(())
    }
}

fn note_from_row(row: &SqliteRow) -> Result<NoteSnapshot> {
    let id: String = row.get("id");
    let tags_json: String = row.get("tags_json");
    let fields_json: String = row.get("fields_json");
    let status: String = row.get("status");
    let created_at: Option<String> = row.get("created_at");
    let modified_at: String = row.get("modified_at");

    Ok(NoteSnapshot {
        owner_id: row.get("owner_id"),
        template_id: row.get("template_id"),
        title: row.get("title"),
        body: row.get("body"),
        tags: serde_json::from_str(&tags_json)
            .with_context(|| format!("note {}: bad tags_json", id))?,
        fields: serde_json::from_str(&fields_json)
            .with_context(|| format!("note {}: bad fields_json", id))?,
        status: status
            .parse::<NoteStatus>()
            .map_err(|e| anyhow::anyhow!("note {}: {}", id, e))?,
        created_at: created_at
            .map(|s| DateTime::parse_from_rfc3339(&s))
            .transpose()
            .with_context(|| format!("note {}: bad created_at", id))?,
        modified_at: DateTime::parse_from_rfc3339(&modified_at)
            .with_context(|| format!("note {}: bad modified_at", id))?,
        id,
    })
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn list_modified(
        &self,
        window: &SyncWindow,
        after: Option<&ModifiedKey>,
        limit: usize,
    ) -> Result<Vec<ModifiedKey>> {
        let mut clauses = Vec::new();
        if window.start.is_some() {
            clauses.push("modified_at_ms >= ?");
        }
        clauses.push(if window.end_inclusive {
            "modified_at_ms <= ?"
        } else {
            "modified_at_ms < ?"
        });
        if after.is_some() {
            clauses.push("(modified_at_ms > ? OR (modified_at_ms = ? AND id > ?))");
        }
        let sql = format!(
            "SELECT id, modified_at_ms FROM notes WHERE {} \
             ORDER BY modified_at_ms ASC, id ASC LIMIT ?",
            clauses.join(" AND ")
        );

        let mut query = sqlx::query(&sql);
        if let Some(start) = window.start {
            query = query.bind(start.timestamp_millis());
        }
        query = query.bind(window.end.timestamp_millis());
        if let Some(key) = after {
            let ms = key.modified_at.timestamp_millis();
            query = query.bind(ms).bind(ms).bind(&key.id);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to list notes in {}", window))?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let ms: i64 = row.get("modified_at_ms");
                let modified_at = DateTime::<Utc>::from_timestamp_millis(ms)
                    .with_context(|| format!("note {}: modified_at_ms out of range", id))?;
                Ok(ModifiedKey { modified_at, id })
            })
            .collect()
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<NoteSnapshot>> {
        let mut notes = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(FETCH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT id, owner_id, template_id, title, body, tags_json, fields_json, \
                 status, created_at, modified_at FROM notes WHERE id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in &rows {
                notes.push(note_from_row(row)?);
            }
        }
        Ok(notes)
    }

    async fn delete_by_owner(&self, owner_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notes WHERE owner_id = ?")
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete notes of owner {}", owner_id))?;
        Ok(result.rows_affected())
    }
}

pub struct SqliteHashLedger {
    pool: SqlitePool,
}

impl SqliteHashLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HashLedger for SqliteHashLedger {
    async fn get(&self, index: IndexKind, document_id: &str) -> Result<Option<HashLedgerEntry>> {
        let row = sqlx::query(
            "SELECT document_id, owner_id, last_known_hash, last_synced_at, last_known_status \
             FROM hash_ledger WHERE index_kind = ? AND document_id = ?",
        )
        .bind(index.as_str())
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn put(&self, index: IndexKind, entry: &HashLedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hash_ledger (index_kind, document_id, owner_id, last_known_hash,
                                     last_synced_at, last_known_status)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(index_kind, document_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                last_known_hash = excluded.last_known_hash,
                last_synced_at = excluded.last_synced_at,
                last_known_status = excluded.last_known_status
            "#,
        )
        .bind(index.as_str())
        .bind(&entry.document_id)
        .bind(&entry.owner_id)
        .bind(entry.last_known_hash.to_hex())
        .bind(entry.last_synced_at.timestamp_millis())
        .bind(entry.last_known_status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, index: IndexKind, document_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM hash_ledger WHERE index_kind = ? AND document_id = ?")
            .bind(index.as_str())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tombstone_by_owner(
        &self,
        index: IndexKind,
        owner_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE hash_ledger SET last_known_status = ?, last_synced_at = MAX(last_synced_at, ?) \
             WHERE index_kind = ? AND owner_id = ?",
        )
        .bind(NoteStatus::Deleted.as_str())
        .bind(deleted_at.timestamp_millis())
        .bind(index.as_str())
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to tombstone ledger entries of owner {}", owner_id))?;
        Ok(result.rows_affected())
    }

    async fn list_after(
        &self,
        index: IndexKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HashLedgerEntry>> {
        let rows = sqlx::query(
            "SELECT document_id, owner_id, last_known_hash, last_synced_at, last_known_status \
             FROM hash_ledger WHERE index_kind = ? AND document_id > ? \
             ORDER BY document_id ASC LIMIT ?",
        )
        .bind(index.as_str())
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<HashLedgerEntry> {
    let hash: String = row.get("last_known_hash");
    let synced_ms: i64 = row.get("last_synced_at");
    let status: String = row.get("last_known_status");
    Ok(HashLedgerEntry {
        document_id: row.get("document_id"),
        owner_id: row.get("owner_id"),
        last_known_hash: ContentHash::from_hex(&hash)?,
        last_synced_at: DateTime::<Utc>::from_timestamp_millis(synced_ms).unwrap_or_default(),
        last_known_status: status
            .parse::<NoteStatus>()
            .map_err(|e| anyhow::anyhow!(e))?,
    })
}

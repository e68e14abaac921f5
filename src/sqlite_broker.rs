//! SQLite-backed [`MessageBroker`]: an append-only log per topic plus one
//! committed offset per `(topic, group)`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use notesync_core::broker::{Message, MessageBroker};

pub struct SqliteBroker {
    pool: SqlitePool,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn committed(&self, topic: &str, group: &str) -> Result<u64> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM broker_offsets WHERE topic = ? AND group_name = ?",
        )
        .bind(topic)
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;
        Ok(next.unwrap_or(0) as u64)
    }
}

fn message_from_row(row: &SqliteRow) -> Message {
    let offset: i64 = row.get("msg_offset");
    let published_ms: i64 = row.get("published_at");
    Message {
        topic: row.get("topic"),
        offset: offset as u64,
        key: row.get("msg_key"),
        payload: row.get("payload"),
        published_at: DateTime::<Utc>::from_timestamp_millis(published_ms).unwrap_or_default(),
    }
}

#[async_trait]
impl MessageBroker for SqliteBroker {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<u64> {
        // Offset allocation and insert in one statement so concurrent
        // publishers serialize on SQLite's write lock.
        let next: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO broker_messages (topic, msg_offset, msg_key, payload, published_at)
            SELECT ?, COALESCE(MAX(msg_offset) + 1, 0), ?, ?, ?
            FROM broker_messages WHERE topic = ?
            RETURNING msg_offset
            "#,
        )
        .bind(topic)
        .bind(key)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .bind(topic)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to publish to {}", topic))?;

        Ok(next as u64)
    }

    async fn poll(&self, topic: &str, group: &str, max: usize) -> Result<Vec<Message>> {
        let from = self.committed(topic, group).await?;
        self.read_topic(topic, from, max).await
    }

    async fn ack(&self, group: &str, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broker_offsets (topic, group_name, next_offset)
            VALUES (?, ?, ?)
            ON CONFLICT(topic, group_name) DO UPDATE SET
                next_offset = MAX(next_offset, excluded.next_offset)
            "#,
        )
        .bind(&message.topic)
        .bind(group)
        .bind(message.offset as i64 + 1)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to ack {}#{} for group {}",
                message.topic, message.offset, group
            )
        })?;
        Ok(())
    }

    async fn read_topic(&self, topic: &str, from: u64, max: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT topic, msg_offset, msg_key, payload, published_at FROM broker_messages \
             WHERE topic = ? AND msg_offset >= ? ORDER BY msg_offset ASC LIMIT ?",
        )
        .bind(topic)
        .bind(from as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }
}

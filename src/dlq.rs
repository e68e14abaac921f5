//! Dead-letter records: publishing, listing, and replay.
//!
//! Every topic has a `<topic>.dlq` sibling. A record keeps the original
//! payload (base64, since it may not be valid UTF-8 or JSON) together with
//! the group that failed it and the reason, which is enough to replay it.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use notesync_core::broker::{dlq_topic, Message, MessageBroker};

/// Consumer group that tracks how far `dlq replay` has progressed.
pub const REPLAY_GROUP: &str = "notesync-dlq-replay";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub original_offset: u64,
    pub consumer_group: String,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub original_key: Option<String>,
    /// Base64 of the raw payload.
    pub original_payload: String,
}

impl DeadLetterRecord {
    pub fn new(group: &str, message: &Message, reason: &str) -> Self {
        Self {
            original_topic: message.topic.clone(),
            original_offset: message.offset,
            consumer_group: group.to_string(),
            failure_reason: reason.to_string(),
            failed_at: Utc::now(),
            original_key: message.key.clone(),
            original_payload: STANDARD.encode(&message.payload),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(self.original_payload.as_bytes())
            .context("dead letter payload is not valid base64")
    }
}

/// Forward a failed message to its DLQ topic.
///
/// Returns false when the DLQ publish itself failed; the failure is
/// logged and the message is dropped.
pub async fn publish(
    broker: &dyn MessageBroker,
    group: &str,
    message: &Message,
    reason: &str,
) -> bool {
    let record = DeadLetterRecord::new(group, message, reason);
    let target = dlq_topic(&message.topic);
    let bytes = match serde_json::to_vec(&record) {
        Ok(b) => b,
        Err(e) => {
            error!(topic = %target, offset = message.offset, error = %e, "cannot encode dead letter; dropping message");
            return false;
        }
    };
    match broker.publish(&target, message.key.as_deref(), &bytes).await {
        Ok(dlq_offset) => {
            warn!(
                topic = %message.topic,
                offset = message.offset,
                group = %group,
                dlq_offset,
                reason = %reason,
                "message dead-lettered"
            );
            true
        }
        Err(e) => {
            error!(
                topic = %message.topic,
                offset = message.offset,
                group = %group,
                error = %format!("{:#}", e),
                "dead-letter publish failed; dropping message"
            );
            false
        }
    }
}

/// Every record currently in `<topic>.dlq`, with its DLQ offset.
pub async fn list(broker: &dyn MessageBroker, topic: &str) -> Result<Vec<(u64, DeadLetterRecord)>> {
    let target = dlq_topic(topic);
    let mut out = Vec::new();
    let mut from = 0;
    loop {
        let batch = broker.read_topic(&target, from, 500).await?;
        if batch.is_empty() {
            break;
        }
        for m in &batch {
            let record: DeadLetterRecord = serde_json::from_slice(&m.payload)
                .with_context(|| format!("{}#{} is not a dead-letter record", target, m.offset))?;
            out.push((m.offset, record));
            from = m.offset + 1;
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub skipped: usize,
}

/// Republish dead letters of `topic` that have not been replayed yet.
///
/// Progress is committed under [`REPLAY_GROUP`], so running replay twice
/// does not duplicate messages. Unreadable records are skipped.
pub async fn replay(broker: &dyn MessageBroker, topic: &str) -> Result<ReplayReport> {
    let target = dlq_topic(topic);
    let mut report = ReplayReport::default();
    loop {
        let batch = broker.poll(&target, REPLAY_GROUP, 100).await?;
        if batch.is_empty() {
            break;
        }
        for m in &batch {
            match serde_json::from_slice::<DeadLetterRecord>(&m.payload) {
                Ok(record) => {
                    let payload = record.payload()?;
                    let offset = broker
                        .publish(&record.original_topic, record.original_key.as_deref(), &payload)
                        .await
                        .with_context(|| format!("Failed to republish {}#{}", target, m.offset))?;
                    info!(
                        dlq = %target,
                        dlq_offset = m.offset,
                        topic = %record.original_topic,
                        offset,
                        "replayed dead letter"
                    );
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!(dlq = %target, dlq_offset = m.offset, error = %e, "skipping unreadable dead letter");
                    report.skipped += 1;
                }
            }
            broker.ack(REPLAY_GROUP, m).await?;
        }
    }
    Ok(report)
}

//! Message broker abstraction.
//!
//! Topics are append-only logs addressed by a monotonically increasing
//! offset. Each consumer group tracks its own committed offset per topic,
//! so several groups can read the same topic independently.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Suffix of the dead-letter sibling of every topic.
pub const DLQ_SUFFIX: &str = ".dlq";

/// The dead-letter topic for `topic`.
pub fn dlq_topic(topic: &str) -> String {
    format!("{}{}", topic, DLQ_SUFFIX)
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a message and return its offset.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<u64>;

    /// Up to `max` messages after the group's committed offset. Polling
    /// does not advance the offset; only [`ack`](MessageBroker::ack) does.
    async fn poll(&self, topic: &str, group: &str, max: usize) -> Result<Vec<Message>>;

    /// Commit `message` for `group`. Acks never move the offset backwards.
    async fn ack(&self, group: &str, message: &Message) -> Result<()>;

    /// Read a topic from `from` regardless of group offsets.
    async fn read_topic(&self, topic: &str, from: u64, max: usize) -> Result<Vec<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_topic() {
        assert_eq!(dlq_topic("cdc.notes"), "cdc.notes.dlq");
    }
}

//! In-memory [`MessageBroker`].

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::{Message, MessageBroker};

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<Message>>,
    /// (topic, group) → next offset to deliver.
    committed: HashMap<(String, String), u64>,
}

pub struct InMemoryBroker {
    state: RwLock<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Messages currently in `topic`.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.state
            .read()
            .map(|s| s.logs.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn committed(&self, topic: &str, group: &str) -> u64 {
        self.state
            .read()
            .ok()
            .and_then(|s| {
                s.committed
                    .get(&(topic.to_string(), group.to_string()))
                    .copied()
            })
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<u64> {
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("broker lock poisoned"))?;
        let log = state.logs.entry(topic.to_string()).or_default();
        let offset = log.len() as u64;
        log.push(Message {
            topic: topic.to_string(),
            offset,
            key: key.map(str::to_string),
            payload: payload.to_vec(),
            published_at: Utc::now(),
        });
        Ok(offset)
    }

    async fn poll(&self, topic: &str, group: &str, max: usize) -> Result<Vec<Message>> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow!("broker lock poisoned"))?;
        let from = state
            .committed
            .get(&(topic.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0);
        Ok(state
            .logs
            .get(topic)
            .map(|log| log.iter().skip(from as usize).take(max).cloned().collect())
            .unwrap_or_default())
    }

    async fn ack(&self, group: &str, message: &Message) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("broker lock poisoned"))?;
        let next = state
            .committed
            .entry((message.topic.clone(), group.to_string()))
            .or_insert(0);
        *next = (*next).max(message.offset + 1);
        Ok(())
    }

    async fn read_topic(&self, topic: &str, from: u64, max: usize) -> Result<Vec<Message>> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow!("broker lock poisoned"))?;
        Ok(state
            .logs
            .get(topic)
            .map(|log| log.iter().skip(from as usize).take(max).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_groups_are_independent() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker
                .publish("t", Some("k"), format!("m{}", i).as_bytes())
                .await
                .unwrap();
        }

        let a = broker.poll("t", "a", 10).await.unwrap();
        assert_eq!(a.len(), 3);
        broker.ack("a", &a[1]).await.unwrap();

        assert_eq!(broker.poll("t", "a", 10).await.unwrap().len(), 1);
        assert_eq!(broker.poll("t", "b", 10).await.unwrap().len(), 3);
        assert_eq!(broker.committed("t", "a"), 2);
    }

    #[tokio::test]
    async fn test_ack_never_rewinds() {
        let broker = InMemoryBroker::new();
        broker.publish("t", None, b"x").await.unwrap();
        broker.publish("t", None, b"y").await.unwrap();
        let msgs = broker.poll("t", "g", 10).await.unwrap();
        broker.ack("g", &msgs[1]).await.unwrap();
        broker.ack("g", &msgs[0]).await.unwrap();
        assert!(broker.poll("t", "g", 10).await.unwrap().is_empty());
    }
}

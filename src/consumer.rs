//! Consumer groups: poll → handle → (dead-letter on failure) → ack.
//!
//! Each group runs as its own tokio task with its own committed offset, so
//! one group's failures or backlog never hold back another group reading
//! the same topic. Acknowledgment is unconditional after the attempt:
//! durability of a failed outcome lives in the DLQ, not in redelivery.
//! Shutdown is observed between messages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use notesync_core::broker::MessageBroker;
use notesync_core::OperationContext;

use crate::dlq;
use crate::handlers::MessageHandler;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub poll_interval: Duration,
    pub max_poll_records: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_poll_records: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub handled: usize,
    pub dead_lettered: usize,
    /// Failed messages whose DLQ publish also failed.
    pub dropped: usize,
}

pub struct ConsumerGroup {
    group: String,
    topic: String,
    handler: Arc<dyn MessageHandler>,
    broker: Arc<dyn MessageBroker>,
    settings: ConsumerSettings,
}

impl ConsumerGroup {
    pub fn new(
        group: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        broker: Arc<dyn MessageBroker>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
            handler,
            broker,
            settings,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Process one poll's worth of messages.
    ///
    /// Errors only when the broker itself fails (poll or ack); handler
    /// failures are dead-lettered and acknowledged.
    pub async fn poll_once(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<PollReport> {
        let messages = self
            .broker
            .poll(&self.topic, &self.group, self.settings.max_poll_records)
            .await?;
        let mut report = PollReport {
            polled: messages.len(),
            ..Default::default()
        };

        for message in &messages {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                debug!(group = %self.group, offset = message.offset, "shutdown requested; stopping mid-poll");
                break;
            }

            let ctx = OperationContext::consumer(&self.topic, &self.group, message.offset);
            match self.handler.handle(&ctx, message).await {
                Ok(()) => {
                    report.handled += 1;
                }
                Err(e) => {
                    if e.is_permanent() {
                        warn!(op_id = %ctx.id, origin = %ctx.origin, error = %e, "message rejected");
                    } else {
                        error!(op_id = %ctx.id, origin = %ctx.origin, error = %e, "message handling failed");
                    }
                    if dlq::publish(self.broker.as_ref(), &self.group, message, &e.to_string()).await {
                        report.dead_lettered += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
            }

            self.broker.ack(&self.group, message).await?;
        }

        Ok(report)
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(group = %self.group, topic = %self.topic, handler = %self.handler.kind(), "consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once(Some(&shutdown)).await {
                // A full poll likely means more is waiting.
                Ok(r) if r.polled > 0 && r.polled >= self.settings.max_poll_records => continue,
                Ok(r) if r.polled > 0 => {
                    debug!(group = %self.group, handled = r.handled, dead_lettered = r.dead_lettered, "poll processed");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(group = %self.group, topic = %self.topic, error = %format!("{:#}", e), "poll failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(group = %self.group, topic = %self.topic, "consumer stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notesync_core::broker::memory::InMemoryBroker;
    use notesync_core::broker::{dlq_topic, Message};
    use std::sync::Mutex;

    use crate::handlers::{HandleError, HandlerKind};

    /// Fails any payload equal to "bad"; records what it saw.
    struct Picky {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Picky {
        fn kind(&self) -> HandlerKind {
            HandlerKind::NoteSync
        }

        async fn handle(&self, _ctx: &OperationContext, message: &Message) -> Result<(), HandleError> {
            let text = String::from_utf8_lossy(&message.payload).to_string();
            self.seen.lock().unwrap().push(text.clone());
            if text == "bad" {
                return Err(HandleError::Payload("bad payload".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_block_poll() {
        let broker = Arc::new(InMemoryBroker::new());
        for p in ["a", "bad", "c"] {
            broker.publish("t", None, p.as_bytes()).await.unwrap();
        }
        let handler = Arc::new(Picky {
            seen: Mutex::new(Vec::new()),
        });
        let group = ConsumerGroup::new("g", "t", handler.clone(), broker.clone(), ConsumerSettings::default());

        let report = group.poll_once(None).await.unwrap();
        assert_eq!(report.polled, 3);
        assert_eq!(report.handled, 2);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["a", "bad", "c"]);
        assert_eq!(broker.committed("t", "g"), 3);
        assert_eq!(broker.messages(&dlq_topic("t")).len(), 1);

        let empty = group.poll_once(None).await.unwrap();
        assert_eq!(empty.polled, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.publish("t", None, b"a").await.unwrap();
        let handler = Arc::new(Picky {
            seen: Mutex::new(Vec::new()),
        });
        let group = ConsumerGroup::new(
            "g",
            "t",
            handler.clone(),
            broker.clone(),
            ConsumerSettings {
                poll_interval: Duration::from_millis(10),
                max_poll_records: 10,
            },
        );
        let (tx, rx) = watch::channel(false);
        let task = group.spawn(rx);

        for _ in 0..100 {
            if broker.committed("t", "g") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(broker.committed("t", "g"), 1);
    }
}

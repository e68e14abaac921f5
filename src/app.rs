//! Runtime wiring.
//!
//! [`Engine`] is built once at startup and owns every collaborator behind
//! an `Arc<dyn …>`. Nothing is looked up globally: consumers, handlers and
//! sweeps all receive their dependencies from here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tokio::sync::watch;
use tracing::info;

use notesync_core::broker::MessageBroker;
use notesync_core::decode::Decoder;
use notesync_core::search::SearchIndex;
use notesync_core::store::{HashLedger, NoteStore};

use crate::config::Config;
use crate::consumer::{ConsumerGroup, ConsumerSettings};
use crate::db;
use crate::handlers::Handler;
use crate::migrate;
use crate::scheduler::{Scheduler, SweepJob, Sweeper};
use crate::search_client::HttpSearchIndex;
use crate::sqlite_broker::SqliteBroker;
use crate::sqlite_store::{SqliteHashLedger, SqliteNoteStore};
use crate::sync::{IndexSyncService, IndexUids};

pub struct Engine {
    config: Config,
    zone: FixedOffset,
    decoder: Decoder,
    broker: Arc<dyn MessageBroker>,
    sync: Arc<IndexSyncService>,
    sweeper: Arc<Sweeper>,
}

impl Engine {
    /// SQLite store, ledger and broker plus the HTTP search client.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await.context("Failed to apply migrations")?;
        let search = HttpSearchIndex::new(&config.search)?;
        Self::with_collaborators(
            config,
            Arc::new(SqliteNoteStore::new(pool.clone())),
            Arc::new(SqliteHashLedger::new(pool.clone())),
            Arc::new(search),
            Arc::new(SqliteBroker::new(pool)),
        )
    }

    pub fn with_collaborators(
        config: Config,
        notes: Arc<dyn NoteStore>,
        ledger: Arc<dyn HashLedger>,
        search: Arc<dyn SearchIndex>,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Self> {
        let zone = config.decoder.offset()?;
        let uids = IndexUids {
            note: config.search.note_index.clone(),
            field: config.search.field_index.clone(),
        };
        let sync = Arc::new(IndexSyncService::new(notes, ledger, search, uids));
        let sweeper = Arc::new(Sweeper::new(sync.clone(), config.sink.window.policy()));
        Ok(Self {
            zone,
            decoder: Decoder::new(zone),
            broker,
            sync,
            sweeper,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn sync(&self) -> &Arc<IndexSyncService> {
        &self.sync
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// One consumer group per resolved `[[consumers]]` binding.
    pub fn consumers(&self) -> Result<Vec<ConsumerGroup>> {
        let settings = ConsumerSettings {
            poll_interval: Duration::from_millis(self.config.consumer.poll_interval_ms),
            max_poll_records: self.config.consumer.max_poll_records,
        };
        Ok(self
            .config
            .resolved_consumers()?
            .into_iter()
            .map(|c| {
                ConsumerGroup::new(
                    c.group,
                    c.topic,
                    Arc::new(Handler::new(c.kind, self.sync.clone(), self.decoder)),
                    self.broker.clone(),
                    settings,
                )
            })
            .collect())
    }

    pub fn scheduler(&self) -> Result<Scheduler> {
        Ok(Scheduler::new(
            self.sweeper.clone(),
            SweepJob::from_config(&self.config)?,
            self.zone,
        ))
    }

    /// Run every consumer group and sweep job until `shutdown` is set.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut handles = Vec::new();
        for group in self.consumers()? {
            info!(group = %group.group(), topic = %group.topic(), "starting consumer group");
            handles.push(group.spawn(shutdown.clone()));
        }
        handles.extend(self.scheduler()?.spawn(shutdown.clone()));

        for handle in handles {
            handle.await.context("worker task panicked")?;
        }
        Ok(())
    }
}

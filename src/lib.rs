//! # notesync
//!
//! Keeps a search index eventually consistent with an authoritative note
//! store along two independent paths: a CDC event stream, and periodic
//! time-windowed reconciliation sweeps driven by content hashes. Account
//! withdrawals cascade into the store and both indexes through independent
//! consumer groups.
//!
//! ## Architecture
//!
//! ```text
//!  CDC / domain topics          primary store (notes)
//!          │                            │
//!          ▼                            ▼
//!  ┌──────────────┐            ┌─────────────────┐
//!  │  consumers   │            │    scheduler    │
//!  │ decode+DLQ   │            │ minor/major     │
//!  └──────┬───────┘            └────────┬────────┘
//!         └──────────┬──────────────────┘
//!                    ▼
//!           ┌─────────────────┐     ┌─────────────┐
//!           │ IndexSyncService│────▶│ hash ledger │
//!           └────────┬────────┘     └─────────────┘
//!                    ▼
//!             search engine (note index, field index)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite note store and hash ledger |
//! | [`sqlite_broker`] | SQLite topic log with consumer-group offsets |
//! | [`search_client`] | HTTP search engine client |
//! | [`sync`] | Compare-then-upsert index sync service |
//! | [`handlers`] | Handler kinds and message handlers |
//! | [`consumer`] | Consumer group worker loops |
//! | [`dlq`] | Dead-letter records and replay |
//! | [`scheduler`] | Cron-driven reconciliation sweeps |
//! | [`app`] | Engine wiring |

pub mod app;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dlq;
pub mod handlers;
pub mod migrate;
pub mod scheduler;
pub mod search_client;
pub mod sqlite_broker;
pub mod sqlite_store;
pub mod sync;

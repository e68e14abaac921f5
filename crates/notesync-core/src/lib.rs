//! # notesync core
//!
//! Runtime-free logic shared by the notesync engine: note snapshots, the
//! content hash used as a drift detector, the CDC envelope decoder, sync
//! window algebra, cron schedules, the search filter DSL, and the
//! collaborator traits (store, ledger, search index, broker) together with
//! in-memory implementations.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies.

pub mod broker;
pub mod context;
pub mod cron;
pub mod decode;
pub mod filter;
pub mod hash;
pub mod models;
pub mod projection;
pub mod search;
pub mod store;
pub mod window;

pub use context::{OperationContext, Origin};
pub use hash::{compute_hash, ContentHash};
pub use models::{IndexKind, IndexRecord, NoteSnapshot, NoteStatus, OperationKind};
pub use window::{Cadence, SyncWindow, WindowPolicy};

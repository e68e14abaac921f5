//! Storage abstractions used by the sync engine.
//!
//! The engine never owns the primary note store; it only needs windowed
//! reads, lookups by id, and a delete-by-owner for account withdrawal.
//! The [`HashLedger`] on the other hand is owned by the engine and holds
//! the last content hash written to each index.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{HashLedgerEntry, IndexKind, NoteSnapshot};
use crate::window::SyncWindow;

/// Position of one note in `(modified_at, id)` order.
///
/// [`NoteStore::list_modified`] pages by key rather than by offset, so
/// rows deleted or re-modified between pages never shift later rows
/// past the cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModifiedKey {
    pub modified_at: DateTime<Utc>,
    pub id: String,
}

impl ModifiedKey {
    pub fn new(modified_at: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            modified_at,
            id: id.into(),
        }
    }
}

/// Read access to the primary note store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list_modified`](NoteStore::list_modified) | Page keys whose `modified_at` falls in a window |
/// | [`fetch`](NoteStore::fetch) | Load current snapshots for a set of ids |
/// | [`delete_by_owner`](NoteStore::delete_by_owner) | Remove every note of a withdrawn owner |
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Keys in `window` strictly after `after`, ordered by `(modified_at, id)`.
    async fn list_modified(
        &self,
        window: &SyncWindow,
        after: Option<&ModifiedKey>,
        limit: usize,
    ) -> Result<Vec<ModifiedKey>>;

    /// Current snapshots for `ids`. Ids with no stored note are omitted.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<NoteSnapshot>>;

    /// Returns the number of notes removed.
    async fn delete_by_owner(&self, owner_id: &str) -> Result<u64>;
}

/// Per-index record of the last hash written to the search engine.
///
/// Deletes leave tombstones (see [`HashLedgerEntry::tombstone`]) rather
/// than dropping the row; [`remove`](HashLedger::remove) is only for
/// pruning tombstones once the document is verified gone.
#[async_trait]
pub trait HashLedger: Send + Sync {
    async fn get(&self, index: IndexKind, document_id: &str) -> Result<Option<HashLedgerEntry>>;

    /// Insert or replace the entry for `entry.document_id`.
    async fn put(&self, index: IndexKind, entry: &HashLedgerEntry) -> Result<()>;

    /// Returns true when an entry existed.
    async fn remove(&self, index: IndexKind, document_id: &str) -> Result<bool>;

    /// Turn every entry of `owner_id` into a tombstone dated no earlier
    /// than `deleted_at`. Returns the number of entries marked.
    async fn tombstone_by_owner(
        &self,
        index: IndexKind,
        owner_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Entries with `document_id` strictly after `after`, in id order.
    async fn list_after(
        &self,
        index: IndexKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HashLedgerEntry>>;
}

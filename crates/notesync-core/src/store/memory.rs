//! In-memory [`NoteStore`] and [`HashLedger`] implementations for testing.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{HashLedgerEntry, IndexKind, NoteSnapshot, NoteStatus};
use crate::window::SyncWindow;

use super::{HashLedger, ModifiedKey, NoteStore};

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

/// In-memory note store.
pub struct InMemoryNoteStore {
    notes: RwLock<HashMap<String, NoteSnapshot>>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a note, as the primary store's writer would.
    pub fn insert(&self, snapshot: NoteSnapshot) {
        if let Ok(mut notes) = self.notes.write() {
            notes.insert(snapshot.id.clone(), snapshot);
        }
    }

    pub fn remove(&self, id: &str) -> Option<NoteSnapshot> {
        self.notes.write().ok().and_then(|mut n| n.remove(id))
    }

    pub fn len(&self) -> usize {
        self.notes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn list_modified(
        &self,
        window: &SyncWindow,
        after: Option<&ModifiedKey>,
        limit: usize,
    ) -> Result<Vec<ModifiedKey>> {
        let notes = self.notes.read().map_err(poisoned)?;
        let mut keys: Vec<ModifiedKey> = notes
            .values()
            .filter(|n| window.contains(n.modified_at_utc()))
            .map(|n| ModifiedKey::new(n.modified_at_utc(), n.id.clone()))
            .filter(|k| after.map_or(true, |a| k > a))
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<NoteSnapshot>> {
        let notes = self.notes.read().map_err(poisoned)?;
        Ok(ids.iter().filter_map(|id| notes.get(id).cloned()).collect())
    }

    async fn delete_by_owner(&self, owner_id: &str) -> Result<u64> {
        let mut notes = self.notes.write().map_err(poisoned)?;
        let before = notes.len();
        notes.retain(|_, n| n.owner_id != owner_id);
        Ok((before - notes.len()) as u64)
    }
}

/// In-memory hash ledger keyed by `(index, document_id)`.
pub struct InMemoryHashLedger {
    entries: RwLock<HashMap<(IndexKind, String), HashLedgerEntry>>,
}

impl InMemoryHashLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self, index: IndexKind) -> usize {
        self.entries
            .read()
            .map(|e| e.keys().filter(|(k, _)| *k == index).count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryHashLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HashLedger for InMemoryHashLedger {
    async fn get(&self, index: IndexKind, document_id: &str) -> Result<Option<HashLedgerEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&(index, document_id.to_string())).cloned())
    }

    async fn put(&self, index: IndexKind, entry: &HashLedgerEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert((index, entry.document_id.clone()), entry.clone());
        Ok(())
    }

    async fn remove(&self, index: IndexKind, document_id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(entries.remove(&(index, document_id.to_string())).is_some())
    }

    async fn tombstone_by_owner(
        &self,
        index: IndexKind,
        owner_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let mut marked = 0;
        for ((k, _), e) in entries.iter_mut() {
            if *k == index && e.owner_id == owner_id {
                e.last_known_status = NoteStatus::Deleted;
                e.last_synced_at = e.last_synced_at.max(deleted_at);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn list_after(
        &self,
        index: IndexKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HashLedgerEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut page: Vec<HashLedgerEntry> = entries
            .iter()
            .filter(|((k, id), _)| *k == index && after.map_or(true, |a| id.as_str() > a))
            .map(|(_, e)| e.clone())
            .collect();
        page.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        page.truncate(limit);
        Ok(page)
    }
}

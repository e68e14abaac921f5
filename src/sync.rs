//! Index sync service: the single writer of the search indexes and the
//! hash ledger.
//!
//! Both convergence paths (CDC consumers and reconciliation sweeps) go
//! through the same compare-then-upsert protocol:
//!
//! 1. project the snapshot for the index and hash the projection
//! 2. compare with the ledger entry (no entry ⇒ changed)
//! 3. if changed, upsert the record, then store the new hash
//!
//! The write is a pure function of current content, so whichever path
//! lands last wins and repeated applies of the same content are no-ops.
//!
//! Deletes leave a tombstone in the ledger dated at the deletion. A
//! snapshot modified at or before that instant is stale and never
//! reaches the index, whichever path delivers it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use notesync_core::filter::Filter;
use notesync_core::models::HashLedgerEntry;
use notesync_core::projection;
use notesync_core::search::SearchIndex;
use notesync_core::store::{HashLedger, NoteStore};
use notesync_core::{
    ContentHash, IndexKind, NoteSnapshot, NoteStatus, OperationContext, OperationKind, SyncWindow,
};

/// Search-engine attribute holding the note owner.
pub const OWNER_ATTRIBUTE: &str = "ownerId";

/// Result of applying one change to one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Content hash matched the ledger; nothing was written.
    Unchanged,
    /// Record upserted and ledger updated.
    Written,
    /// Record removed and the ledger entry turned into a tombstone.
    Deleted,
    /// Snapshot is not newer than the document's tombstone; nothing was written.
    Stale,
}

/// Per-index outcomes of [`IndexSyncService::apply_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub note: ApplyOutcome,
    pub field: ApplyOutcome,
}

impl ApplyReport {
    pub fn get(&self, index: IndexKind) -> ApplyOutcome {
        match index {
            IndexKind::Note => self.note,
            IndexKind::Field => self.field,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub candidates: usize,
    pub unchanged: usize,
    pub written: usize,
    pub removed: usize,
    /// Live notes older than their tombstone, kept out of the index.
    pub stale: usize,
    /// Candidates whose content could not be hashed.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: &ReconcileReport) {
        self.candidates += other.candidates;
        self.unchanged += other.unchanged;
        self.written += other.written;
        self.removed += other.removed;
        self.stale += other.stale;
        self.failed += other.failed;
    }
}

/// Outcome of [`IndexSyncService::audit_ledger`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerAuditReport {
    pub entries: usize,
    /// Live entries whose note is gone from the store.
    pub orphaned: usize,
    /// Records found in the index and deleted.
    pub removed: usize,
    /// Tombstones dropped once the note is gone from both sides.
    pub pruned: usize,
}

impl LedgerAuditReport {
    pub fn merge(&mut self, other: &LedgerAuditReport) {
        self.entries += other.entries;
        self.orphaned += other.orphaned;
        self.removed += other.removed;
        self.pruned += other.pruned;
    }
}

/// Engine index uids for both index kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexUids {
    pub note: String,
    pub field: String,
}

impl IndexUids {
    pub fn get(&self, index: IndexKind) -> &str {
        match index {
            IndexKind::Note => &self.note,
            IndexKind::Field => &self.field,
        }
    }
}

pub struct IndexSyncService {
    notes: Arc<dyn NoteStore>,
    ledger: Arc<dyn HashLedger>,
    search: Arc<dyn SearchIndex>,
    uids: IndexUids,
}

impl IndexSyncService {
    pub fn new(
        notes: Arc<dyn NoteStore>,
        ledger: Arc<dyn HashLedger>,
        search: Arc<dyn SearchIndex>,
        uids: IndexUids,
    ) -> Self {
        Self {
            notes,
            ledger,
            search,
            uids,
        }
    }

    pub fn uid(&self, index: IndexKind) -> &str {
        self.uids.get(index)
    }

    /// Apply a change to every index.
    ///
    /// Both indexes are attempted even when the first fails; the first
    /// error is returned afterwards.
    #[instrument(skip_all, fields(op_id = %ctx.id, origin = %ctx.origin, note = %snapshot.id, op = op.code()))]
    pub async fn apply_change(
        &self,
        ctx: &OperationContext,
        snapshot: &NoteSnapshot,
        op: OperationKind,
    ) -> Result<ApplyReport> {
        let note = self.apply_to(ctx, IndexKind::Note, snapshot, op).await;
        let field = self.apply_to(ctx, IndexKind::Field, snapshot, op).await;
        Ok(ApplyReport {
            note: note?,
            field: field?,
        })
    }

    /// Apply a change to one index.
    pub async fn apply_to(
        &self,
        ctx: &OperationContext,
        index: IndexKind,
        snapshot: &NoteSnapshot,
        op: OperationKind,
    ) -> Result<ApplyOutcome> {
        let uid = self.uid(index);

        if op == OperationKind::Delete || snapshot.is_deleted() {
            return self
                .delete_document(
                    ctx,
                    index,
                    &snapshot.id,
                    Some(&snapshot.owner_id),
                    snapshot.modified_at_utc(),
                )
                .await;
        }

        let existing = self.ledger.get(index, &snapshot.id).await?;
        if let Some(tombstone) = existing
            .as_ref()
            .filter(|e| e.supersedes(snapshot.modified_at_utc()))
        {
            info!(
                op_id = %ctx.id,
                %index,
                note = %snapshot.id,
                modified_at = %snapshot.modified_at,
                deleted_at = %tombstone.last_synced_at,
                "snapshot predates deletion; skipped"
            );
            return Ok(ApplyOutcome::Stale);
        }

        let hash = projection::content_hash(index, snapshot)
            .with_context(|| format!("Failed to hash note {}", snapshot.id))?;

        if existing.as_ref().is_some_and(|e| e.is_current(&hash)) {
            debug!(op_id = %ctx.id, %index, note = %snapshot.id, %hash, "unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        let record = projection::record(index, snapshot);
        self.search
            .upsert_batch(uid, std::slice::from_ref(&record))
            .await
            .with_context(|| format!("Failed to upsert {} into {}", snapshot.id, uid))?;
        self.ledger
            .put(index, &ledger_entry(snapshot, hash))
            .await?;
        debug!(op_id = %ctx.id, %index, note = %snapshot.id, %hash, "written");
        Ok(ApplyOutcome::Written)
    }

    /// Remove one note from one index and leave a tombstone dated
    /// `deleted_at` in its place.
    pub async fn delete_document(
        &self,
        ctx: &OperationContext,
        index: IndexKind,
        id: &str,
        owner_id: Option<&str>,
        deleted_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let uid = self.uid(index);
        self.search
            .delete_batch(uid, &[id.to_string()])
            .await
            .with_context(|| format!("Failed to delete {} from {}", id, uid))?;
        self.tombstone(index, id, owner_id, deleted_at).await?;
        debug!(op_id = %ctx.id, %index, note = %id, %deleted_at, "deleted");
        Ok(ApplyOutcome::Deleted)
    }

    /// An existing tombstone only ever moves forward in time.
    async fn tombstone(
        &self,
        index: IndexKind,
        id: &str,
        owner_id: Option<&str>,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        let entry = match self.ledger.get(index, id).await? {
            Some(previous) => {
                let deleted_at = if previous.is_tombstone() {
                    previous.last_synced_at.max(deleted_at)
                } else {
                    deleted_at
                };
                let owner = owner_id.map_or(previous.owner_id, str::to_string);
                HashLedgerEntry::tombstone(id, owner, previous.last_known_hash, deleted_at)
            }
            None => HashLedgerEntry::tombstone(
                id,
                owner_id.unwrap_or_default(),
                ContentHash::from_u128(0),
                deleted_at,
            ),
        };
        self.ledger.put(index, &entry).await
    }

    /// Repair drift for a batch of candidate ids.
    ///
    /// Active notes take the compare/upsert path in one batched write.
    /// Deleted notes, ids no longer in the store, and notes older than
    /// their tombstone are verified absent from the index.
    #[instrument(skip_all, fields(op_id = %ctx.id, origin = %ctx.origin, %index, window = %window, candidates = candidate_ids.len()))]
    pub async fn reconcile(
        &self,
        ctx: &OperationContext,
        index: IndexKind,
        candidate_ids: &[String],
        window: &SyncWindow,
    ) -> Result<ReconcileReport> {
        let uid = self.uid(index);
        let mut report = ReconcileReport {
            candidates: candidate_ids.len(),
            ..Default::default()
        };
        if candidate_ids.is_empty() {
            return Ok(report);
        }

        let snapshots = self.notes.fetch(candidate_ids).await?;
        let by_id: HashMap<&str, &NoteSnapshot> =
            snapshots.iter().map(|s| (s.id.as_str(), s)).collect();
        let now = Utc::now();

        let mut absent = Vec::new();
        let mut tombstones = Vec::new();
        let mut records = Vec::new();
        let mut entries = Vec::new();

        for id in candidate_ids {
            let existing = self.ledger.get(index, id).await?;
            let tombstoned = existing.as_ref().is_some_and(|e| e.is_tombstone());

            let snapshot = match by_id.get(id.as_str()) {
                None => {
                    absent.push(id.clone());
                    if !tombstoned {
                        tombstones.push((id.as_str(), None, now));
                    }
                    continue;
                }
                Some(s) if s.is_deleted() => {
                    absent.push(id.clone());
                    if !tombstoned {
                        tombstones.push((id.as_str(), Some(s.owner_id.as_str()), s.modified_at_utc()));
                    }
                    continue;
                }
                Some(s) => *s,
            };

            if existing
                .as_ref()
                .is_some_and(|e| e.supersedes(snapshot.modified_at_utc()))
            {
                absent.push(id.clone());
                report.stale += 1;
                continue;
            }

            let hash = match projection::content_hash(index, snapshot) {
                Ok(h) => h,
                Err(e) => {
                    warn!(op_id = %ctx.id, %index, note = %id, error = %e, "cannot hash note; skipped");
                    report.failed += 1;
                    continue;
                }
            };
            if existing.as_ref().is_some_and(|e| e.is_current(&hash)) {
                report.unchanged += 1;
            } else {
                records.push(projection::record(index, snapshot));
                entries.push(ledger_entry(snapshot, hash));
            }
        }

        if !records.is_empty() {
            self.search
                .upsert_batch(uid, &records)
                .await
                .with_context(|| format!("Failed to upsert {} records into {}", records.len(), uid))?;
            for entry in &entries {
                self.ledger.put(index, entry).await?;
            }
            report.written = records.len();
        }

        if !absent.is_empty() {
            report.removed = self.ensure_absent(uid, &absent).await?;
            for (id, owner_id, deleted_at) in tombstones {
                self.tombstone(index, id, owner_id, deleted_at).await?;
            }
        }

        if report.written > 0 || report.removed > 0 {
            info!(
                op_id = %ctx.id,
                %index,
                written = report.written,
                removed = report.removed,
                unchanged = report.unchanged,
                stale = report.stale,
                "repaired drift"
            );
        }
        Ok(report)
    }

    /// Check one page of ledger entries against the store and the index.
    ///
    /// A live entry whose note is gone from the store (or marked deleted)
    /// is an orphan: its record is removed and the entry becomes a
    /// tombstone. Tombstoned documents are verified absent, and a
    /// tombstone dated at or before `prune_before` whose note is no longer
    /// stored at all is dropped.
    #[instrument(skip_all, fields(op_id = %ctx.id, origin = %ctx.origin, %index, entries = entries.len()))]
    pub async fn audit_ledger(
        &self,
        ctx: &OperationContext,
        index: IndexKind,
        entries: &[HashLedgerEntry],
        prune_before: DateTime<Utc>,
    ) -> Result<LedgerAuditReport> {
        let uid = self.uid(index);
        let mut report = LedgerAuditReport {
            entries: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = entries.iter().map(|e| e.document_id.clone()).collect();
        let snapshots = self.notes.fetch(&ids).await?;
        let by_id: HashMap<&str, &NoteSnapshot> =
            snapshots.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut absent = Vec::new();
        let mut orphans = Vec::new();
        let mut prunable = Vec::new();

        for entry in entries {
            let stored = by_id.get(entry.document_id.as_str()).copied();
            let live = stored.filter(|s| !s.is_deleted());
            match (entry.is_tombstone(), live) {
                (false, Some(_)) => {}
                (false, None) => {
                    absent.push(entry.document_id.clone());
                    let deleted_at = stored.map_or(entry.last_synced_at, |s| s.modified_at_utc());
                    orphans.push(HashLedgerEntry::tombstone(
                        entry.document_id.clone(),
                        entry.owner_id.clone(),
                        entry.last_known_hash,
                        deleted_at,
                    ));
                }
                (true, Some(s)) => {
                    if entry.supersedes(s.modified_at_utc()) {
                        absent.push(entry.document_id.clone());
                    }
                }
                (true, None) => {
                    absent.push(entry.document_id.clone());
                    if stored.is_none() && entry.last_synced_at <= prune_before {
                        prunable.push(entry.document_id.as_str());
                    }
                }
            }
        }

        if absent.is_empty() {
            return Ok(report);
        }
        report.removed = self.ensure_absent(uid, &absent).await?;
        for orphan in &orphans {
            self.ledger.put(index, orphan).await?;
        }
        report.orphaned = orphans.len();
        for id in prunable {
            if self.ledger.remove(index, id).await? {
                report.pruned += 1;
            }
        }

        if report.removed > 0 || report.orphaned > 0 {
            info!(
                op_id = %ctx.id,
                %index,
                orphaned = report.orphaned,
                removed = report.removed,
                pruned = report.pruned,
                "ledger audit repaired drift"
            );
        }
        Ok(report)
    }

    /// Delete whichever of `ids` the index still holds. Returns how many.
    async fn ensure_absent(&self, uid: &str, ids: &[String]) -> Result<usize> {
        let present = self.search.existing_ids(uid, ids).await?;
        if !present.is_empty() {
            self.search
                .delete_batch(uid, &present)
                .await
                .with_context(|| format!("Failed to delete {} records from {}", present.len(), uid))?;
        }
        Ok(present.len())
    }

    /// Remove every record of `owner_id` from one index and tombstone its
    /// ledger entries at `deleted_at`.
    #[instrument(skip_all, fields(op_id = %ctx.id, origin = %ctx.origin, %index, owner = %owner_id))]
    pub async fn purge_owner(
        &self,
        ctx: &OperationContext,
        index: IndexKind,
        owner_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<u64> {
        let uid = self.uid(index);
        self.search
            .delete_by_filter(uid, &Filter::eq(OWNER_ATTRIBUTE, owner_id))
            .await
            .with_context(|| format!("Failed to purge owner {} from {}", owner_id, uid))?;
        let marked = self
            .ledger
            .tombstone_by_owner(index, owner_id, deleted_at)
            .await?;
        info!(op_id = %ctx.id, %index, owner = %owner_id, tombstoned = marked, "purged owner");
        Ok(marked)
    }

    /// Delete the primary-store notes of a withdrawn owner.
    #[instrument(skip_all, fields(op_id = %ctx.id, origin = %ctx.origin, owner = %owner_id))]
    pub async fn delete_owner_notes(&self, ctx: &OperationContext, owner_id: &str) -> Result<u64> {
        let removed = self.notes.delete_by_owner(owner_id).await?;
        info!(op_id = %ctx.id, owner = %owner_id, removed, "deleted owner notes");
        Ok(removed)
    }

    /// Current snapshot of one note from the primary store.
    pub async fn load(&self, id: &str) -> Result<Option<NoteSnapshot>> {
        Ok(self.notes.fetch(&[id.to_string()]).await?.into_iter().next())
    }

    pub fn notes(&self) -> &Arc<dyn NoteStore> {
        &self.notes
    }

    pub fn ledger(&self) -> &Arc<dyn HashLedger> {
        &self.ledger
    }
}

fn ledger_entry(snapshot: &NoteSnapshot, hash: ContentHash) -> HashLedgerEntry {
    HashLedgerEntry {
        document_id: snapshot.id.clone(),
        owner_id: snapshot.owner_id.clone(),
        last_known_hash: hash,
        last_synced_at: Utc::now(),
        last_known_status: NoteStatus::Active,
    }
}

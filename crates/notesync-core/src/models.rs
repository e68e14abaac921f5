//! Core data models shared by the decoder, the sync service and the stores.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::ContentHash;

/// Lifecycle status of a note in the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    Active,
    Deleted,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Active => "active",
            NoteStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for NoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(NoteStatus::Active),
            "deleted" => Ok(NoteStatus::Deleted),
            other => Err(format!("unknown note status '{}'", other)),
        }
    }
}

/// Point-in-time view of a note record in the primary store.
///
/// Produced by the CDC decoder or by a windowed read. `id`, `created_at`
/// and `modified_at` are identity/audit fields and never take part in the
/// content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSnapshot {
    pub id: String,
    pub owner_id: String,
    pub template_id: Option<String>,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    /// Template field values keyed by field name.
    pub fields: Map<String, Value>,
    pub status: NoteStatus,
    pub created_at: Option<DateTime<FixedOffset>>,
    pub modified_at: DateTime<FixedOffset>,
}

impl NoteSnapshot {
    pub fn is_deleted(&self) -> bool {
        self.status == NoteStatus::Deleted
    }

    pub fn modified_at_utc(&self) -> DateTime<Utc> {
        self.modified_at.with_timezone(&Utc)
    }
}

/// CDC operation kind (`op` in the change envelope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    SnapshotRead,
}

impl OperationKind {
    /// Parse the single-letter envelope code (`c`, `u`, `d`, `r`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(OperationKind::Create),
            "u" => Some(OperationKind::Update),
            "d" => Some(OperationKind::Delete),
            "r" => Some(OperationKind::SnapshotRead),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OperationKind::Create => "c",
            OperationKind::Update => "u",
            OperationKind::Delete => "d",
            OperationKind::SnapshotRead => "r",
        }
    }
}

/// The two independently maintained search projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Primary note index: title, body, tags.
    Note,
    /// Field-value index: template field values for faceting.
    Field,
}

impl IndexKind {
    pub const ALL: [IndexKind; 2] = [IndexKind::Note, IndexKind::Field];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Note => "note",
            IndexKind::Field => "field",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" | "note-index" => Ok(IndexKind::Note),
            "field" | "field-index" => Ok(IndexKind::Field),
            other => Err(format!(
                "unknown index '{}'. Must be note or field.",
                other
            )),
        }
    }
}

/// A note's projection as stored in one search index, keyed by note id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl IndexRecord {
    /// The record as a single JSON object, id included.
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = self.body.clone();
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        doc
    }
}

/// One hash-ledger row: the last content hash written to an index.
///
/// A row with `last_known_status == Deleted` is a tombstone: the document
/// was removed from the index and `last_synced_at` holds the instant of
/// the deletion. Snapshots modified at or before that instant are stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashLedgerEntry {
    pub document_id: String,
    pub owner_id: String,
    pub last_known_hash: ContentHash,
    pub last_synced_at: DateTime<Utc>,
    pub last_known_status: NoteStatus,
}

impl HashLedgerEntry {
    pub fn tombstone(
        document_id: impl Into<String>,
        owner_id: impl Into<String>,
        last_known_hash: ContentHash,
        deleted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            owner_id: owner_id.into(),
            last_known_hash,
            last_synced_at: deleted_at,
            last_known_status: NoteStatus::Deleted,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.last_known_status == NoteStatus::Deleted
    }

    /// True when this tombstone outranks a snapshot modified at `modified_at`.
    pub fn supersedes(&self, modified_at: DateTime<Utc>) -> bool {
        self.is_tombstone() && modified_at <= self.last_synced_at
    }

    /// True when this entry records `hash` as currently indexed.
    pub fn is_current(&self, hash: &ContentHash) -> bool {
        !self.is_tombstone() && self.last_known_hash.matches(hash)
    }
}

//! Message handlers and the handler-kind registry.
//!
//! Handler kinds are resolved from config strings once at startup; an
//! unknown key is a startup error, never a runtime lookup failure.
//!
//! | Kind | Topic (default) | Side effect |
//! |------|-----------------|-------------|
//! | `note-sync` | `topics.note-cdc` | decode CDC envelope, apply to both indexes |
//! | `note-created` | `{domain}.note.created` | load note, apply to both indexes |
//! | `note-deleted` | `{domain}.note.deleted` | delete from both indexes |
//! | `withdraw-notes` | `topics.withdraw` | delete the owner's notes from the store |
//! | `withdraw-note-index` | `topics.withdraw` | purge the owner from the note index |
//! | `withdraw-field-index` | `topics.withdraw` | purge the owner from the field index |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use notesync_core::broker::Message;
use notesync_core::decode::{DecodeError, Decoder};
use notesync_core::{IndexKind, OperationContext, OperationKind};

use crate::sync::IndexSyncService;

#[derive(Debug, Error, PartialEq)]
#[error("unknown handler '{0}'. Must be one of: note-sync, note-created, note-deleted, withdraw-notes, withdraw-note-index, withdraw-field-index")]
pub struct UnknownHandler(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    NoteSync,
    NoteCreated,
    NoteDeleted,
    WithdrawNotes,
    WithdrawNoteIndex,
    WithdrawFieldIndex,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 6] = [
        HandlerKind::NoteSync,
        HandlerKind::NoteCreated,
        HandlerKind::NoteDeleted,
        HandlerKind::WithdrawNotes,
        HandlerKind::WithdrawNoteIndex,
        HandlerKind::WithdrawFieldIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::NoteSync => "note-sync",
            HandlerKind::NoteCreated => "note-created",
            HandlerKind::NoteDeleted => "note-deleted",
            HandlerKind::WithdrawNotes => "withdraw-notes",
            HandlerKind::WithdrawNoteIndex => "withdraw-note-index",
            HandlerKind::WithdrawFieldIndex => "withdraw-field-index",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = UnknownHandler;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HandlerKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownHandler(s.to_string()))
    }
}

/// Why a message could not be handled. Every variant ends in the DLQ.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("downstream failure: {0:#}")]
    Downstream(#[from] anyhow::Error),
}

impl HandleError {
    /// Decode and payload errors will fail identically on replay.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, HandleError::Downstream(_))
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    async fn handle(&self, ctx: &OperationContext, message: &Message) -> Result<(), HandleError>;
}

/// `{domain}.note.created` / `{domain}.note.deleted` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEvent {
    pub note_id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// `user.withdraw.requested` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalEvent {
    pub user_id: String,
    #[serde(default)]
    pub requested_at: Option<Value>,
}

impl WithdrawalEvent {
    pub fn requested_at(&self, decoder: &Decoder) -> Result<Option<DateTime<FixedOffset>>, DecodeError> {
        match &self.requested_at {
            None | Some(Value::Null) => Ok(None),
            Some(v) => decoder.parse_timestamp("requestedAt", v).map(Some),
        }
    }
}

fn parse_payload<'a, T: Deserialize<'a>>(message: &'a Message) -> Result<T, HandleError> {
    serde_json::from_slice(&message.payload).map_err(|e| HandleError::Payload(e.to_string()))
}

/// The built-in handler for one [`HandlerKind`].
pub struct Handler {
    kind: HandlerKind,
    sync: Arc<IndexSyncService>,
    decoder: Decoder,
}

impl Handler {
    pub fn new(kind: HandlerKind, sync: Arc<IndexSyncService>, decoder: Decoder) -> Self {
        Self {
            kind,
            sync,
            decoder,
        }
    }

    async fn withdrawal(&self, message: &Message) -> Result<WithdrawalEvent, HandleError> {
        let event: WithdrawalEvent = parse_payload(message)?;
        if event.user_id.trim().is_empty() {
            return Err(HandleError::Payload("userId is empty".to_string()));
        }
        let requested_at = event.requested_at(&self.decoder)?;
        info!(
            handler = %self.kind,
            user = %event.user_id,
            requested_at = ?requested_at,
            "withdrawal requested"
        );
        Ok(event)
    }
}

#[async_trait]
impl MessageHandler for Handler {
    fn kind(&self) -> HandlerKind {
        self.kind
    }

    async fn handle(&self, ctx: &OperationContext, message: &Message) -> Result<(), HandleError> {
        match self.kind {
            HandlerKind::NoteSync => {
                let change = self.decoder.decode(&message.payload)?;
                self.sync
                    .apply_change(ctx, &change.snapshot, change.op)
                    .await?;
            }
            HandlerKind::NoteCreated => {
                let event: NoteEvent = parse_payload(message)?;
                match self.sync.load(&event.note_id).await? {
                    Some(snapshot) => {
                        self.sync
                            .apply_change(ctx, &snapshot, OperationKind::Create)
                            .await?;
                    }
                    None => {
                        // Not visible in the store yet; the next minor sweep covers it.
                        warn!(op_id = %ctx.id, note = %event.note_id, "created note not found in store");
                    }
                }
            }
            HandlerKind::NoteDeleted => {
                let event: NoteEvent = parse_payload(message)?;
                let owner = event.owner_id.as_deref();
                let deleted_at = Utc::now();
                let note = self
                    .sync
                    .delete_document(ctx, IndexKind::Note, &event.note_id, owner, deleted_at)
                    .await;
                let field = self
                    .sync
                    .delete_document(ctx, IndexKind::Field, &event.note_id, owner, deleted_at)
                    .await;
                note?;
                field?;
            }
            HandlerKind::WithdrawNotes => {
                let event = self.withdrawal(message).await?;
                self.sync.delete_owner_notes(ctx, &event.user_id).await?;
            }
            HandlerKind::WithdrawNoteIndex => {
                let event = self.withdrawal(message).await?;
                self.sync
                    .purge_owner(ctx, IndexKind::Note, &event.user_id, Utc::now())
                    .await?;
            }
            HandlerKind::WithdrawFieldIndex => {
                let event = self.withdrawal(message).await?;
                self.sync
                    .purge_owner(ctx, IndexKind::Field, &event.user_id, Utc::now())
                    .await?;
            }
        }
        Ok(())
    }
}

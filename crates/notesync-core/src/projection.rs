//! Snapshot → index record mappings, one pair of functions per index.
//!
//! `content` is what gets hashed for an index; `record` is what gets
//! written. Audit fields appear in records (for range filters and display)
//! but never in content.

use serde_json::{Map, Value};

use crate::hash::{self, format_instant, ContentHash, HashError};
use crate::models::{IndexKind, IndexRecord, NoteSnapshot};

/// Hashed content for the given index.
pub fn content(kind: IndexKind, snapshot: &NoteSnapshot) -> Map<String, Value> {
    match kind {
        IndexKind::Note => hash::content_of(snapshot),
        IndexKind::Field => {
            let mut content = Map::new();
            content.insert("ownerId".into(), Value::String(snapshot.owner_id.clone()));
            content.insert(
                "templateId".into(),
                snapshot
                    .template_id
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            content.insert("fields".into(), Value::Object(snapshot.fields.clone()));
            content
        }
    }
}

pub fn content_hash(kind: IndexKind, snapshot: &NoteSnapshot) -> Result<ContentHash, HashError> {
    hash::hash_content(&content(kind, snapshot))
}

pub fn record(kind: IndexKind, snapshot: &NoteSnapshot) -> IndexRecord {
    let mut body = content(kind, snapshot);
    body.insert(
        "modifiedAt".into(),
        Value::String(format_instant(&snapshot.modified_at)),
    );
    body.insert(
        "modifiedAtMs".into(),
        Value::from(snapshot.modified_at.timestamp_millis()),
    );
    if let Some(created) = &snapshot.created_at {
        body.insert("createdAt".into(), Value::String(format_instant(created)));
    }
    if kind == IndexKind::Field {
        // Flattened `name:value` pairs make field values facetable.
        let pairs: Vec<Value> = snapshot
            .fields
            .iter()
            .flat_map(|(name, value)| field_pairs(name, value))
            .map(Value::String)
            .collect();
        body.insert("fieldValues".into(), Value::Array(pairs));
        body.insert(
            "fieldNames".into(),
            Value::Array(snapshot.fields.keys().cloned().map(Value::String).collect()),
        );
    }
    IndexRecord {
        id: snapshot.id.clone(),
        body,
    }
}

fn field_pairs(name: &str, value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![format!("{}:{}", name, s)],
        Value::Array(items) => items.iter().flat_map(|v| field_pairs(name, v)).collect(),
        other => vec![format!("{}:{}", name, other)],
    }
}

//! CDC change-envelope decoding.
//!
//! Turns a `{before, after, source, op, tsMs, transaction}` envelope into a
//! [`NoteSnapshot`]. Timestamps arrive in several encodings and are all
//! projected into one target zone fixed at construction time:
//!
//! | Shape | Example |
//! |-------|---------|
//! | wrapped number | `{"$date": 1700000000000}` |
//! | wrapped millis string | `{"$date": "1700000000000"}` |
//! | wrapped ISO string | `{"$date": "2023-11-14T22:13:20Z"}` |
//! | bare number | `1700000000000` |
//! | bare ISO string | `"2023-11-14T22:13:20Z"` |
//!
//! Resolution order: unwrap `$date` (and `$numberLong`), integer epoch
//! millis, zoned ISO-8601, then zone-less local ISO-8601 read in the target
//! zone. Any failure is final for the message.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hash::format_instant;
use crate::models::{NoteSnapshot, NoteStatus, OperationKind};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("envelope has no '{0}' payload")]
    MissingPayload(&'static str),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("unparseable timestamp in '{field}': {raw}")]
    InvalidTimestamp { field: String, raw: String },
}

/// Source metadata block of an envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceInfo {
    #[serde(default, rename = "tsMs", alias = "ts_ms")]
    pub ts_ms: Option<i64>,
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub ord: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "total_order")]
    pub total_order: Option<i64>,
}

/// The CDC wire record.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
    pub op: String,
    #[serde(default)]
    pub source: Option<SourceInfo>,
    #[serde(default, rename = "tsMs", alias = "ts_ms")]
    pub ts_ms: Option<i64>,
    #[serde(default)]
    pub transaction: Option<TransactionInfo>,
}

/// Result of decoding one envelope.
#[derive(Debug, Clone)]
pub struct DecodedChange {
    pub op: OperationKind,
    pub snapshot: NoteSnapshot,
    pub source_ts: Option<DateTime<FixedOffset>>,
    pub transaction_id: Option<String>,
}

/// Envelope decoder bound to the system's target zone.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    zone: FixedOffset,
}

impl Decoder {
    pub fn new(zone: FixedOffset) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    pub fn decode(&self, raw: &[u8]) -> Result<DecodedChange, DecodeError> {
        let envelope: ChangeEnvelope = serde_json::from_slice(raw)?;
        self.decode_envelope(envelope)
    }

    pub fn decode_envelope(&self, envelope: ChangeEnvelope) -> Result<DecodedChange, DecodeError> {
        let op = OperationKind::from_code(&envelope.op)
            .ok_or_else(|| DecodeError::UnknownOperation(envelope.op.clone()))?;

        let (payload, name) = match op {
            OperationKind::Delete => (envelope.before, "before"),
            _ => (envelope.after, "after"),
        };
        let payload = match payload {
            None | Some(Value::Null) => return Err(DecodeError::MissingPayload(name)),
            // Document-store connectors ship the payload as a JSON string.
            Some(Value::String(s)) => serde_json::from_str::<Value>(&s)?,
            Some(v) => v,
        };
        let object = payload.as_object().ok_or_else(|| DecodeError::InvalidField {
            field: name.to_string(),
            reason: "payload is not an object".to_string(),
        })?;

        let envelope_ts = envelope
            .ts_ms
            .or_else(|| envelope.source.as_ref().and_then(|s| s.ts_ms));
        let source_ts = match envelope_ts {
            Some(ms) => Some(self.from_millis("tsMs", ms)?),
            None => None,
        };

        let mut snapshot = self.snapshot_from(object, source_ts)?;
        if op == OperationKind::Delete {
            snapshot.status = NoteStatus::Deleted;
        }

        Ok(DecodedChange {
            op,
            snapshot,
            source_ts,
            transaction_id: envelope.transaction.and_then(|t| t.id),
        })
    }

    /// Build a snapshot from a payload object. `fallback_ts` stands in for a
    /// missing modification time (delete envelopes often lack one).
    pub fn snapshot_from(
        &self,
        object: &Map<String, Value>,
        fallback_ts: Option<DateTime<FixedOffset>>,
    ) -> Result<NoteSnapshot, DecodeError> {
        let id = object
            .get("_id")
            .or_else(|| object.get("id"))
            .map(|v| identifier("_id", v))
            .transpose()?
            .ok_or(DecodeError::MissingField("_id"))?;
        let owner_id = object
            .get("ownerId")
            .map(|v| identifier("ownerId", v))
            .transpose()?
            .ok_or(DecodeError::MissingField("ownerId"))?;
        let template_id = match object.get("templateId") {
            None | Some(Value::Null) => None,
            Some(v) => Some(identifier("templateId", v)?),
        };

        let modified_at = match first_present(object, &["modifiedAt", "updatedAt"]) {
            Some((field, v)) => self.parse_timestamp(field, v)?,
            None => fallback_ts.ok_or(DecodeError::MissingField("modifiedAt"))?,
        };
        let created_at = match object.get("createdAt") {
            None | Some(Value::Null) => None,
            Some(v) => Some(self.parse_timestamp("createdAt", v)?),
        };

        let tags = match object.get("tags") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|t| {
                    t.as_str().map(str::to_string).ok_or_else(|| DecodeError::InvalidField {
                        field: "tags".to_string(),
                        reason: format!("non-string tag {}", t),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(DecodeError::InvalidField {
                    field: "tags".to_string(),
                    reason: format!("expected array, got {}", other),
                })
            }
        };

        let fields = match object.get("fields") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.normalize_field_value(k, v)?)))
                .collect::<Result<Map<_, _>, DecodeError>>()?,
            Some(other) => {
                return Err(DecodeError::InvalidField {
                    field: "fields".to_string(),
                    reason: format!("expected object, got {}", other),
                })
            }
        };

        let deleted_flag = object.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        let status = match object.get("status").and_then(Value::as_str) {
            Some(s) => s.parse::<NoteStatus>().map_err(|reason| DecodeError::InvalidField {
                field: "status".to_string(),
                reason,
            })?,
            None if deleted_flag => NoteStatus::Deleted,
            None => NoteStatus::Active,
        };

        Ok(NoteSnapshot {
            id,
            owner_id,
            template_id,
            title: string_field(object, "title")?,
            body: string_field(object, "body")?,
            tags,
            fields,
            status,
            created_at,
            modified_at,
        })
    }

    /// Resolve any supported timestamp encoding into the target zone.
    pub fn parse_timestamp(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<DateTime<FixedOffset>, DecodeError> {
        let invalid = || DecodeError::InvalidTimestamp {
            field: field.to_string(),
            raw: value.to_string(),
        };
        match unwrap_date(value) {
            Value::Number(n) => {
                let ms = n.as_i64().ok_or_else(invalid)?;
                self.from_millis(field, ms)
            }
            Value::String(s) => {
                let s = s.trim();
                if let Ok(ms) = s.parse::<i64>() {
                    return self.from_millis(field, ms);
                }
                self.parse_iso(s).ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }

    fn from_millis(&self, field: &str, ms: i64) -> Result<DateTime<FixedOffset>, DecodeError> {
        DateTime::from_timestamp_millis(ms)
            .map(|dt| dt.with_timezone(&self.zone))
            .ok_or_else(|| DecodeError::InvalidTimestamp {
                field: field.to_string(),
                raw: ms.to_string(),
            })
    }

    fn parse_iso(&self, s: &str) -> Option<DateTime<FixedOffset>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&self.zone));
        }
        if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
            return Some(dt.with_timezone(&self.zone));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|pattern| NaiveDateTime::parse_from_str(s, pattern).ok())
            .and_then(|naive| self.zone.from_local_datetime(&naive).single())
    }

    /// Date-wrapped field values become fixed-pattern text so they hash
    /// the same no matter how the connector encoded them.
    fn normalize_field_value(&self, name: &str, value: &Value) -> Result<Value, DecodeError> {
        match value {
            Value::Object(map) if map.contains_key("$date") => {
                let dt = self.parse_timestamp(name, value)?;
                Ok(Value::String(format_instant(&dt)))
            }
            Value::Object(map) if map.len() == 1 && map.contains_key("$numberLong") => map
                ["$numberLong"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .map(Value::from)
                .ok_or_else(|| DecodeError::InvalidField {
                    field: name.to_string(),
                    reason: "bad $numberLong".to_string(),
                }),
            Value::Object(map) if map.len() == 1 && map.contains_key("$oid") => {
                Ok(Value::String(identifier(name, value)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.normalize_field_value(name, v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }
}

fn unwrap_date(value: &Value) -> &Value {
    let inner = value.get("$date").unwrap_or(value);
    inner.get("$numberLong").unwrap_or(inner)
}

fn identifier(field: &str, value: &Value) -> Result<String, DecodeError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Object(map) => match map.get("$oid").and_then(Value::as_str) {
            Some(oid) => Ok(oid.to_string()),
            None => Err(DecodeError::InvalidField {
                field: field.to_string(),
                reason: format!("unsupported identifier {}", value),
            }),
        },
        _ => Err(DecodeError::InvalidField {
            field: field.to_string(),
            reason: format!("unsupported identifier {}", value),
        }),
    }
}

fn string_field(object: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(DecodeError::InvalidField {
            field: field.to_string(),
            reason: format!("expected string, got {}", other),
        }),
    }
}

fn first_present<'a>(
    object: &'a Map<String, Value>,
    names: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    names
        .iter()
        .find_map(|n| object.get(*n).filter(|v| !v.is_null()).map(|v| (*n, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> Decoder {
        Decoder::new(FixedOffset::east_opt(9 * 3600).unwrap())
    }

    fn envelope(op: &str, modified: Value) -> Vec<u8> {
        let payload = json!({
            "_id": {"$oid": "65f0c0ffee"},
            "ownerId": "U1",
            "title": "A",
            "tags": ["x"],
            "modifiedAt": modified,
        });
        let (before, after) = if op == "d" {
            (payload, Value::Null)
        } else {
            (Value::Null, payload)
        };
        serde_json::to_vec(&json!({
            "before": before,
            "after": after,
            "op": op,
            "source": {"tsMs": 1_700_000_000_500i64, "db": "notes", "collection": "note"},
            "tsMs": 1_700_000_000_900i64,
        }))
        .unwrap()
    }

    #[test]
    fn test_all_timestamp_shapes_agree() {
        let shapes = vec![
            json!({"$date": 1_700_000_000_000i64}),
            json!({"$date": "1700000000000"}),
            json!({"$date": "2023-11-14T22:13:20Z"}),
            json!(1_700_000_000_000i64),
            json!("2023-11-14T22:13:20Z"),
            json!({"$date": {"$numberLong": "1700000000000"}}),
            json!("2023-11-15T07:13:20+09:00"),
        ];
        let d = decoder();
        let instants: Vec<_> = shapes
            .into_iter()
            .map(|s| d.decode(&envelope("u", s)).unwrap().snapshot.modified_at)
            .collect();
        for i in &instants {
            assert_eq!(*i, instants[0]);
            assert_eq!(i.offset().local_minus_utc(), 9 * 3600);
        }
        assert_eq!(instants[0].timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_zoneless_local_is_read_in_target_zone() {
        let d = decoder();
        let change = d.decode(&envelope("c", json!("2023-11-15T07:13:20"))).unwrap();
        assert_eq!(change.snapshot.modified_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_unparseable_timestamp_fails() {
        let err = decoder()
            .decode(&envelope("u", json!("yesterday")))
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_delete_reads_before_payload() {
        let change = decoder().decode(&envelope("d", json!(1_700_000_000_000i64))).unwrap();
        assert_eq!(change.op, OperationKind::Delete);
        assert_eq!(change.snapshot.id, "65f0c0ffee");
        assert!(change.snapshot.is_deleted());
    }

    #[test]
    fn test_missing_after_is_an_error() {
        let raw = serde_json::to_vec(&json!({"op": "u", "after": null})).unwrap();
        assert!(matches!(
            decoder().decode(&raw).unwrap_err(),
            DecodeError::MissingPayload("after")
        ));
    }

    #[test]
    fn test_unknown_op() {
        let raw = serde_json::to_vec(&json!({"op": "x", "after": {}})).unwrap();
        assert!(matches!(
            decoder().decode(&raw).unwrap_err(),
            DecodeError::UnknownOperation(_)
        ));
    }

    #[test]
    fn test_string_payload_and_field_dates() {
        let after = json!({
            "_id": "n2",
            "ownerId": "U2",
            "modifiedAt": {"$date": 1_700_000_000_000i64},
            "fields": {"due": {"$date": "2023-11-14T22:13:20Z"}, "n": {"$numberLong": "7"}}
        })
        .to_string();
        let raw = serde_json::to_vec(&json!({"op": "c", "after": after})).unwrap();
        let change = decoder().decode(&raw).unwrap();
        assert_eq!(change.snapshot.fields["due"], json!("2023-11-15 07:13:20"));
        assert_eq!(change.snapshot.fields["n"], json!(7));
    }

    #[test]
    fn test_missing_owner_fails() {
        let raw = serde_json::to_vec(&json!({
            "op": "c",
            "after": {"_id": "n3", "modifiedAt": 1}
        }))
        .unwrap();
        assert!(matches!(
            decoder().decode(&raw).unwrap_err(),
            DecodeError::MissingField("ownerId")
        ));
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(matches!(
            decoder().decode(b"not json").unwrap_err(),
            DecodeError::Malformed(_)
        ));
    }
}

//! Content hashing: the drift detector behind every index write.
//!
//! A [`ContentHash`] is a 128-bit SipHash-1-3 digest over the canonical
//! JSON form of a note's content fields. Canonical means:
//!
//! - object keys sorted lexicographically at every depth,
//! - numbers in fixed decimal form (no exponent, `1.0` renders as `1`),
//! - dates already rendered as `yyyy-MM-dd HH:mm:ss` text.
//!
//! Equal content therefore hashes equal regardless of map insertion order.
//! This is a change detector, not a security primitive.

use std::fmt;
use std::hash::Hasher;

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use siphasher::sip128::{Hasher128, SipHasher13};
use thiserror::Error;

use crate::models::NoteSnapshot;

/// Textual date pattern used inside hashed content.
pub const DATE_PATTERN: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq)]
pub enum HashError {
    #[error("content contains a non-finite number")]
    NonFiniteNumber,
    #[error("invalid content hash '{0}': expected 32 hex characters")]
    InvalidHex(String),
}

/// 128-bit content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(u128);

impl ContentHash {
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != 32 {
            return Err(HashError::InvalidHex(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| HashError::InvalidHex(s.to_string()))
    }

    /// True when both digests denote the same content.
    pub fn matches(&self, other: &ContentHash) -> bool {
        self.0 == other.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Render an instant with the fixed content date pattern, in its own zone.
pub fn format_instant<Tz: TimeZone>(dt: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    dt.format(DATE_PATTERN).to_string()
}

/// Content projection of a snapshot: everything except identity, audit
/// timestamps and lifecycle status.
pub fn content_of(snapshot: &NoteSnapshot) -> Map<String, Value> {
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
    content.insert("title".into(), Value::String(snapshot.title.clone()));
    content.insert("body".into(), Value::String(snapshot.body.clone()));
    content.insert(
        "tags".into(),
        Value::Array(snapshot.tags.iter().cloned().map(Value::String).collect()),
    );
    content.insert("fields".into(), Value::Object(snapshot.fields.clone()));
    content
}

/// Hash a snapshot's full content projection.
pub fn compute_hash(snapshot: &NoteSnapshot) -> Result<ContentHash, HashError> {
    hash_content(&content_of(snapshot))
}

/// Hash an already projected content map.
pub fn hash_content(content: &Map<String, Value>) -> Result<ContentHash, HashError> {
    let mut canonical = String::new();
    write_object(&mut canonical, content)?;
    let mut hasher = SipHasher13::new();
    hasher.write(canonical.as_bytes());
    Ok(ContentHash(hasher.finish128().as_u128()))
}

/// Canonical JSON text for a value.
pub fn canonical_json(value: &Value) -> Result<String, HashError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut String, value: &Value) -> Result<(), HashError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map)?,
    }
    Ok(())
}

fn write_object(out: &mut String, map: &Map<String, Value>) -> Result<(), HashError> {
    // serde_json may be built with preserve_order; sort explicitly.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, &map[key.as_str()])?;
    }
    out.push('}');
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    // serde_json string escaping is deterministic.
    out.push_str(&Value::String(s.to_string()).to_string());
}

fn write_number(out: &mut String, n: &Number) -> Result<(), HashError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else {
        let f = n.as_f64().ok_or(HashError::NonFiniteNumber)?;
        if !f.is_finite() {
            return Err(HashError::NonFiniteNumber);
        }
        // f64 Display never uses exponent notation.
        if f == 0.0 {
            out.push('0');
        } else {
            out.push_str(&f.to_string());
        }
    }
    Ok(())
}

//! On-disk record shapes.
//!
//! ```text
//! primary key "profile":
//!   {"larder":1,"key":"profile","envelope":"01 0c ...hex...","written_at":1718000000000}
//!
//! backup key "profile__backup__2":
//!   {"larder":1,"key":"profile","generation":7,"envelope":"...","timestamp":1718000060000}
//! ```
//!
//! The `larder` format marker separates records written by this crate from
//! legacy plaintext values that happen to be JSON objects.

use super::codec::{CryptoError, Envelope};
use super::error::CorruptionError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current record format marker
pub const RECORD_FORMAT: u32 = 1;

/// Separator between a primary key and its backup slot
pub const BACKUP_SEPARATOR: &str = "__backup__";

/// Unix time in milliseconds
pub type Timestamp = u64;

pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The value actually persisted under a logical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    #[serde(rename = "larder")]
    pub format: u32,
    pub key: String,
    #[serde(with = "envelope_hex")]
    pub envelope: Envelope,
    pub written_at: Timestamp,
}

impl StorageRecord {
    pub fn new(key: &str, envelope: Envelope) -> Self {
        Self {
            format: RECORD_FORMAT,
            key: key.to_string(),
            envelope,
            written_at: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a raw payload that already classified as a candidate.
    pub fn parse(raw: &str, expected_key: &str) -> Result<Self, CorruptionError> {
        let record: Self = parse_marked(raw)?;
        if record.key != expected_key {
            return Err(CorruptionError::KeyMismatch {
                expected: expected_key.to_string(),
                found: record.key,
            });
        }
        Ok(record)
    }
}

/// One rotated snapshot of a key's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    #[serde(rename = "larder")]
    pub format: u32,
    pub key: String,
    pub generation: u32,
    #[serde(with = "envelope_hex")]
    pub envelope: Envelope,
    pub timestamp: Timestamp,
}

impl BackupSnapshot {
    pub fn new(key: &str, generation: u32, envelope: Envelope) -> Self {
        Self {
            format: RECORD_FORMAT,
            key: key.to_string(),
            generation,
            envelope,
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(raw: &str, expected_key: &str) -> Result<Self, CorruptionError> {
        let snapshot: Self = parse_marked(raw)?;
        if snapshot.key != expected_key {
            return Err(CorruptionError::KeyMismatch {
                expected: expected_key.to_string(),
                found: snapshot.key,
            });
        }
        Ok(snapshot)
    }
}

/// Decode a payload carrying the `larder` marker.
///
/// Only a payload without the marker is `NotARecord`. Once the marker is
/// present, any failure (unknown format, bad hex, unknown envelope version,
/// missing field) means a damaged record.
fn parse_marked<T: DeserializeOwned>(raw: &str) -> Result<T, CorruptionError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| CorruptionError::NotARecord(e.to_string()))?;
    let marker = value
        .get("larder")
        .ok_or_else(|| CorruptionError::NotARecord("no larder marker".to_string()))?;

    let damaged = |detail: String| CorruptionError::Crypto(CryptoError::Malformed(detail));
    match marker.as_u64() {
        Some(format) if format == u64::from(RECORD_FORMAT) => {}
        _ => return Err(damaged(format!("unknown record format {}", marker))),
    }
    serde_json::from_value(value).map_err(|e| damaged(format!("damaged record: {}", e)))
}

/// Storage key of backup slot `slot` for `key`.
pub fn backup_key(key: &str, slot: u32) -> String {
    format!("{key}{BACKUP_SEPARATOR}{slot}")
}

/// Split a backup storage key into `(primary key, slot)`.
pub fn parse_backup_key(storage_key: &str) -> Option<(&str, u32)> {
    let (base, slot) = storage_key.rsplit_once(BACKUP_SEPARATOR)?;
    let slot = slot.parse().ok()?;
    Some((base, slot))
}

mod envelope_hex {
    use super::Envelope;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(envelope: &Envelope, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&envelope.to_hex())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Envelope, D::Error> {
        let text = String::deserialize(d)?;
        Envelope::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

//! Digests, canonical payload encoding and the record hash.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::error::LedgerError;
use crate::ledger::RecordStatus;

const RECORD_DOMAIN_TAG: &[u8] = b"depinguard-record-v1:";
const PAYLOAD_DOMAIN_TAG: &[u8] = b"depinguard-payload-v1:";

/// A SHA-256 digest, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// `prev_hash` of the first record.
    pub const GENESIS: Digest = Digest([0u8; 32]);

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize `payload` as JSON with object keys sorted at every depth and
/// no insignificant whitespace.
pub fn canonical_json<T: Serialize + ?Sized>(payload: &T) -> Result<String, LedgerError> {
    let value = serde_json::to_value(payload).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), LedgerError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_scalar(&Value::String(key.clone()))?);
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&encode_scalar(scalar)?),
    }
    Ok(())
}

fn encode_scalar(value: &Value) -> Result<String, LedgerError> {
    serde_json::to_string(value).map_err(|e| LedgerError::Serialization(e.to_string()))
}

/// Hash of the canonical payload encoding.
pub fn payload_hash<T: Serialize + ?Sized>(payload: &T) -> Result<Digest, LedgerError> {
    let canonical = canonical_json(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(PAYLOAD_DOMAIN_TAG);
    hasher.update(canonical.as_bytes());
    Ok(Digest(hasher.finalize().into()))
}

/// Hash committing every stored field of a record.
///
/// Variable-length fields are length prefixed so no two field tuples share
/// an encoding.
pub fn record_hash(
    index: u64,
    device_id: &str,
    payload_hash: &Digest,
    prev_hash: &Digest,
    created_at: &DateTime<Utc>,
    status: RecordStatus,
) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(RECORD_DOMAIN_TAG);
    hasher.update(index.to_be_bytes());
    hasher.update((device_id.len() as u64).to_be_bytes());
    hasher.update(device_id.as_bytes());
    hasher.update(payload_hash.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(created_at.timestamp().to_be_bytes());
    hasher.update(created_at.timestamp_subsec_nanos().to_be_bytes());
    let status = status.as_str();
    hasher.update((status.len() as u64).to_be_bytes());
    hasher.update(status.as_bytes());
    Digest(hasher.finalize().into())
}

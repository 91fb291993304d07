//! Versioned JSON envelope for everything persisted to disk.
//!
//! Every record is written as `{"version":1,"record":{...}}`. Readers reject
//! any other version rather than guessing at a migration.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version written by this build.
pub const RECORD_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    version: u32,
    record: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    record: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("unsupported record version {found} (expected {RECORD_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize `record` inside a versioned envelope.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, RecordError> {
    Ok(serde_json::to_vec_pretty(&EnvelopeOut {
        version: RECORD_VERSION,
        record,
    })?)
}

/// Parse an envelope and the record inside it.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RecordError> {
    let envelope: EnvelopeIn = serde_json::from_slice(bytes)?;
    if envelope.version != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion {
            found: envelope.version,
        });
    }
    Ok(serde_json::from_value(envelope.record)?)
}

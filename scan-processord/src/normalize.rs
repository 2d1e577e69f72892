//! Converts versioned scan payloads into canonical records.

use serde_json::Value;
use shared::types::{CanonicalRecord, ScanRecord, SchemaVersion, V1Data, V2Data};
use crate::error::NormalizeError;

/// A payload decoded under its declared schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPayload {
    V1(V1Data),
    V2(V2Data),
}

impl ScanPayload {
    /// Decode `data` strictly as `version`. The shape is never used to guess
    /// a version: a V2 body declared as V1 is malformed.
    pub fn decode(version: SchemaVersion, data: Value) -> Result<Self, NormalizeError> {
        let malformed = |e: serde_json::Error| NormalizeError::MalformedPayload {
            version,
            reason: e.to_string(),
        };

        match version {
            SchemaVersion::V1 => serde_json::from_value(data).map(ScanPayload::V1).map_err(malformed),
            SchemaVersion::V2 => serde_json::from_value(data).map(ScanPayload::V2).map_err(malformed),
        }
    }

    pub fn version(&self) -> SchemaVersion {
        match self {
            ScanPayload::V1(_) => SchemaVersion::V1,
            ScanPayload::V2(_) => SchemaVersion::V2,
        }
    }

    /// Response text carried by the payload. Empty text is an error.
    pub fn into_response_text(self) -> Result<String, NormalizeError> {
        let version = self.version();
        let text = match self {
            ScanPayload::V1(data) => String::from_utf8(data.response_bytes_utf8).map_err(|e| {
                NormalizeError::MalformedPayload {
                    version,
                    reason: format!("response bytes are not UTF-8: {}", e),
                }
            })?,
            ScanPayload::V2(data) => data.response_str,
        };

        if text.is_empty() {
            return Err(NormalizeError::EmptyNormalizedResult(version));
        }
        Ok(text)
    }
}

/// Normalize a raw `data` value declared as `data_version` into response text.
pub fn normalize(data: Value, data_version: i64) -> Result<String, NormalizeError> {
    let version =
        SchemaVersion::try_from(data_version).map_err(NormalizeError::UnknownSchemaVersion)?;
    ScanPayload::decode(version, data)?.into_response_text()
}

/// Normalize a whole wire record, keeping its identity and scan time.
pub fn canonicalize(record: ScanRecord) -> Result<CanonicalRecord, NormalizeError> {
    let key = record.key();
    let response = normalize(record.data, record.data_version)?;
    Ok(CanonicalRecord {
        key,
        timestamp: record.timestamp,
        response,
    })
}

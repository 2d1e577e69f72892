//! Error types for each pipeline boundary.

use shared::types::SchemaVersion;
use thiserror::Error;

/// Why a payload could not be turned into response text.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unknown schema version {0}")]
    UnknownSchemaVersion(i64),

    #[error("payload does not match schema {version}: {reason}")]
    MalformedPayload {
        version: SchemaVersion,
        reason: String,
    },

    #[error("schema {0} payload normalized to an empty response")]
    EmptyNormalizedResult(SchemaVersion),
}

/// Storage engine failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The thread owning the connection has stopped
    #[error("store is unavailable")]
    Unavailable,
}

/// Message bus transport failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bus returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid bus response: {0}")]
    Decode(String),
}

/// Per-message pipeline failure. None of these acknowledge the message.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to decode scan envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("failed to persist scan: {0}")]
    Persistence(#[from] StoreError),
}

impl IngestError {
    /// Stable label used as the `kind` field in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Decode(_) => "decode",
            IngestError::Normalize(NormalizeError::UnknownSchemaVersion(_)) => {
                "unknown_schema_version"
            }
            IngestError::Normalize(NormalizeError::MalformedPayload { .. }) => "malformed_payload",
            IngestError::Normalize(NormalizeError::EmptyNormalizedResult(_)) => {
                "empty_normalized_result"
            }
            IngestError::Persistence(_) => "persistence",
        }
    }
}

/// Startup failures establishing the subscription. Always fatal.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("failed to create subscription {subscription} on topic {topic}: {source}")]
    CreateSubscription {
        topic: String,
        subscription: String,
        #[source]
        source: BusError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_kinds() {
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(IngestError::from(decode).kind(), "decode");
        assert_eq!(
            IngestError::from(NormalizeError::UnknownSchemaVersion(3)).kind(),
            "unknown_schema_version"
        );
        assert_eq!(
            IngestError::from(NormalizeError::EmptyNormalizedResult(SchemaVersion::V2)).kind(),
            "empty_normalized_result"
        );
        assert_eq!(IngestError::from(StoreError::Unavailable).kind(), "persistence");
    }
}

use std::fmt;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Identity of a scanned endpoint. One stored row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanKey {
    pub ip: String,
    pub port: u16,
    pub service: String,
}

impl fmt::Display for ScanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.service)
    }
}

/// A scan observation as published on the bus.
///
/// `data` stays untyped here: its shape depends on `data_version`, and the
/// declared version decides how it is decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRecord {
    pub ip: String,
    pub port: u16,
    pub service: String,

    /// Scan time, compared to order observations of the same key
    #[serde(alias = "last_scanned")]
    pub timestamp: i64,

    /// Schema discriminator for `data`
    #[serde(alias = "schema_version", alias = "version")]
    pub data_version: i64,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl ScanRecord {
    pub fn key(&self) -> ScanKey {
        ScanKey {
            ip: self.ip.clone(),
            port: self.port,
            service: self.service.clone(),
        }
    }
}

/// Payload schema versions understood by this release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub const ALL: [SchemaVersion; 2] = [SchemaVersion::V1, SchemaVersion::V2];

    pub fn as_i64(self) -> i64 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }
}

impl TryFrom<i64> for SchemaVersion {
    /// The unrecognised discriminator
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SchemaVersion::V1),
            2 => Ok(SchemaVersion::V2),
            other => Err(other),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.as_i64())
    }
}

/// V1 `data`: raw response bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct V1Data {
    #[serde(deserialize_with = "deserialize_wire_bytes")]
    pub response_bytes_utf8: Vec<u8>,
}

/// V2 `data`: response already decoded to text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct V2Data {
    pub response_str: String,
}

/// Byte slices arrive either base64 encoded (Go's `[]byte` JSON encoding)
/// or as a plain array of byte values.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireBytes {
    Base64(String),
    Array(Vec<u8>),
}

fn deserialize_wire_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    match WireBytes::deserialize(deserializer)? {
        WireBytes::Base64(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom),
        WireBytes::Array(bytes) => Ok(bytes),
    }
}

/// Version-independent form of one observation, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub key: ScanKey,
    pub timestamp: i64,
    /// Never empty
    pub response: String,
}

/// The latest observation persisted for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredScan {
    pub ip: String,
    pub port: u16,
    pub service: String,
    pub last_scanned: i64,
    pub response: String,
}

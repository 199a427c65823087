//! Message formats

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// How binary payloads (array buffers, byte strings) are carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Base64 text, for formats without a native byte string type
    Base64Text,
    /// Native byte strings
    RawBytes,
}

/// Wire encoding selected when a session is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, self-describing text
    Json,
    /// Compact binary
    #[default]
    Cbor,
}

impl MessageFormat {
    pub fn name(self) -> &'static str {
        match self {
            MessageFormat::Json => "json",
            MessageFormat::Cbor => "cbor",
        }
    }

    pub fn payload_encoding(self) -> PayloadEncoding {
        match self {
            MessageFormat::Json => PayloadEncoding::Base64Text,
            MessageFormat::Cbor => PayloadEncoding::RawBytes,
        }
    }

    pub fn to_bytes<T: Serialize>(self, message: &T) -> CodecResult<Vec<u8>> {
        match self {
            MessageFormat::Json => {
                serde_json::to_vec(message).map_err(|e| CodecError::Serialization(e.to_string()))
            }
            MessageFormat::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(message, &mut buf)
                    .map_err(|e| CodecError::Serialization(e.to_string()))?;
                Ok(buf)
            }
        }
    }

    pub fn from_bytes<T: DeserializeOwned>(self, bytes: &[u8]) -> CodecResult<T> {
        match self {
            MessageFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| CodecError::Deserialization(e.to_string())),
            MessageFormat::Cbor => ciborium::from_reader(bytes)
                .map_err(|e| CodecError::Deserialization(e.to_string())),
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(MessageFormat::Json),
            "cbor" | "binary" => Ok(MessageFormat::Cbor),
            other => Err(CodecError::Deserialization(format!(
                "unknown message format '{}', expected json or cbor",
                other
            ))),
        }
    }
}

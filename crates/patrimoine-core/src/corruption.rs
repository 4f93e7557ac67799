//! Classification of failed decode attempts.
//!
//! Every codec funnels its failures through [`classify`]. Only an absent value
//! is benign; a ciphertext that does not authenticate and a plaintext that does
//! not parse into the expected shape both become [`DataCorruptionError`].

use std::fmt;

use serde::Serialize;

use crate::error::DataCorruptionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    AbsentValue,
    CorruptCiphertext,
    MalformedPlaintext,
}

/// The two error-bearing classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorruptionKind {
    CorruptCiphertext,
    MalformedPlaintext,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionKind::CorruptCiphertext => f.write_str("corrupt ciphertext"),
            CorruptionKind::MalformedPlaintext => f.write_str("malformed plaintext"),
        }
    }
}

/// Raw reason a single decode attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum DecodeFault {
    #[error("no value stored")]
    Missing,

    #[error("blob is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("envelope truncated ({len} bytes)")]
    Truncated { len: usize },

    #[error("unknown envelope format 0x{0:02x}")]
    UnknownFormat(u8),

    #[error("authentication failed (tampered data or wrong key)")]
    Authentication,

    #[error("plaintext is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("plaintext is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("expected a JSON {expected}, found {found}")]
    Shape {
        expected: &'static str,
        found: &'static str,
    },

    #[error("JSON does not match the field schema: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Map a decode failure onto the classifier's three outcomes.
pub fn classify(fault: &DecodeFault) -> Classification {
    match fault {
        DecodeFault::Missing => Classification::AbsentValue,
        DecodeFault::Encoding(_)
        | DecodeFault::Truncated { .. }
        | DecodeFault::UnknownFormat(_)
        | DecodeFault::Authentication => Classification::CorruptCiphertext,
        DecodeFault::Utf8(_)
        | DecodeFault::Json(_)
        | DecodeFault::Shape { .. }
        | DecodeFault::Schema(_) => Classification::MalformedPlaintext,
    }
}

/// Resolve a decode attempt for `field`: absent values become `None`, every
/// other fault becomes a [`DataCorruptionError`].
pub fn resolve<T>(
    field: &str,
    attempt: std::result::Result<T, DecodeFault>,
) -> std::result::Result<Option<T>, DataCorruptionError> {
    match attempt {
        Ok(value) => Ok(Some(value)),
        Err(fault) => {
            let kind = match classify(&fault) {
                Classification::AbsentValue => return Ok(None),
                Classification::CorruptCiphertext => CorruptionKind::CorruptCiphertext,
                Classification::MalformedPlaintext => CorruptionKind::MalformedPlaintext,
            };
            Err(DataCorruptionError {
                field: field.to_string(),
                kind,
                detail: fault.to_string(),
            })
        }
    }
}

/// JSON type name used in shape mismatch reports.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

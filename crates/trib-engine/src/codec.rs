//! Envelope codec: JSON wire format to and from [`Envelope`].
//!
//! Wire shape: `{"operation": string, "data": {"name": string, "expired": string, "brand": string}}`.
//! A missing or unknown `operation` decodes fine and surfaces as
//! [`Operation::Unrecognized`]; a missing `data` object or natural key does not.

use trib_types::{Envelope, Operation, Product};

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope is missing the `data` field")]
    MissingData,
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: &'static str },
}

#[derive(serde::Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    data: Option<Product>,
}

#[derive(serde::Serialize)]
struct WireEnvelopeRef<'a> {
    operation: &'a str,
    data: &'a Product,
}

/// Decode raw log bytes into an [`Envelope`]. No side effects.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireEnvelope = serde_json::from_value(value)?;
    let data = wire.data.ok_or(DecodeError::MissingData)?;

    if data.name.is_empty() {
        return Err(DecodeError::InvalidField { field: "data.name", reason: "must not be empty" });
    }
    if data.name.contains('\0') {
        return Err(DecodeError::InvalidField { field: "data.name", reason: "must not contain NUL" });
    }

    let operation = Operation::parse(wire.operation.as_deref().unwrap_or_default());
    Ok(Envelope { operation, data })
}

/// Encode an [`Envelope`] into the wire format read by [`decode`].
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&WireEnvelopeRef {
        operation: envelope.operation.as_str(),
        data: &envelope.data,
    })
}

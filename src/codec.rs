//! Reply-envelope wire format shared with servers.
//!
//! The engine itself moves opaque frames; this module is the narrow codec
//! surface the caller and the test servers agree on. A response frame body
//! is a postcard-encoded [`ReplyEnvelope`]: either the successful reply
//! payload, a declared fault with its fields intact, or an undeclared
//! remote error carrying only a message.
//!
//! Full request/response codecs (binary, compact, JSON) are external
//! collaborators and out of scope here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Error produced by envelope or payload (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("codec error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Marker trait for types that can cross the wire.
///
/// Automatically implemented for all `Serialize + Deserialize` types.
pub trait Wire: Serialize + for<'de> Deserialize<'de> {}
impl<T> Wire for T where T: Serialize + for<'de> Deserialize<'de> {}

/// Serializes a payload value to bytes.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if serialization fails.
pub fn encode_message<T: Wire>(msg: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_stdvec(msg)?)
}

/// Deserializes a payload value from bytes.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if the bytes do not decode as `T`.
pub fn decode_message<T: Wire>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// A declared remote fault: an application-level error that is explicitly
/// part of a service's contract.
///
/// Field values survive the round trip through the engine unchanged; the
/// callback's error value carries exactly what the server encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Human-readable fault message.
    pub message: String,
    /// Structured fault fields, as declared by the service.
    pub fields: BTreeMap<String, String>,
}

impl Fault {
    /// Creates a fault with a message and no structured fields.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.fields.is_empty() {
            write!(f, " ({} fields)", self.fields.len())?;
        }
        Ok(())
    }
}

/// The body of a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyEnvelope {
    /// Successful reply; contains the serialized result payload.
    Ok(Vec<u8>),
    /// Declared fault from the service's contract.
    Fault(Fault),
    /// Undeclared server-side failure.
    Error(String),
}

/// Encodes a reply envelope to a frame body.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if serialization fails.
pub fn encode_envelope(envelope: &ReplyEnvelope) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_stdvec(envelope)?)
}

/// Decodes a response frame body into a reply envelope.
///
/// # Errors
///
/// Returns [`CodecError::Postcard`] if the body is not a valid envelope;
/// the engine treats that as a protocol violation.
pub fn decode_envelope(frame: &[u8]) -> Result<ReplyEnvelope, CodecError> {
    Ok(postcard::from_bytes(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let bytes = encode_message(&42i32).unwrap();
        let decoded: i32 = decode_message(&bytes).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn envelope_ok_round_trip() {
        let payload = encode_message(&"hello".to_string()).unwrap();
        let bytes = encode_envelope(&ReplyEnvelope::Ok(payload.clone())).unwrap();
        match decode_envelope(&bytes).unwrap() {
            ReplyEnvelope::Ok(p) => assert_eq!(p, payload),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn fault_fields_survive_round_trip() {
        let mut fault = Fault::new("blah");
        fault
            .fields
            .insert("detail".to_string(), "value".to_string());

        let bytes = encode_envelope(&ReplyEnvelope::Fault(fault.clone())).unwrap();
        match decode_envelope(&bytes).unwrap() {
            ReplyEnvelope::Fault(decoded) => assert_eq!(decoded, fault),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn empty_fault_map_round_trips_empty() {
        let fault = Fault::new("blah");
        let bytes = encode_envelope(&ReplyEnvelope::Fault(fault)).unwrap();
        match decode_envelope(&bytes).unwrap() {
            ReplyEnvelope::Fault(decoded) => {
                assert_eq!(decoded.message, "blah");
                assert!(decoded.fields.is_empty());
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_not_an_envelope() {
        assert!(decode_envelope(&[0xff, 0xfe, 0xfd]).is_err());
    }
}

//! Wire codec.
//!
//! The wire uses snake_case for every envelope key and every `type` tag.
//! Peers that send camelCase (`sessionId`) or kebab-case (`session-id`,
//! `delete-session`) are normalized here, at the process boundary, so the
//! rest of the crate only ever sees one convention. Payload objects nested
//! under `payload` / `result` are opaque and left untouched.

use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::protocol::MessageTypes;
use crate::protocol::messages::{ClientMessage, Envelope};

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Valid JSON object with a `type` tag this side does not understand.
    UnknownType(String),
    /// Not JSON, not an object, no `type`, or fields of the wrong shape.
    Malformed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown message type: {t}"),
            Self::Malformed(reason) => write!(f, "malformed message: {reason}"),
        }
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::ProtocolError {
            reason: err.to_string(),
        }
    }
}

/// Convert a camelCase or kebab-case identifier to snake_case.
pub fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c == '-' || c == ' ' {
            out.push('_');
            prev_lower = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// Normalize top-level keys and the `type` tag of a wire object.
fn normalize_envelope(object: Map<String, Value>) -> Map<String, Value> {
    object
        .into_iter()
        .map(|(key, value)| {
            let key = to_snake_case(&key);
            let value = match (key.as_str(), value) {
                ("type", Value::String(tag)) => Value::String(to_snake_case(&tag)),
                (_, other) => other,
            };
            (key, value)
        })
        .collect()
}

/// Parse a frame into a normalized JSON object and its `type` tag.
fn parse_object(text: &str) -> Result<(Map<String, Value>, String), DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    };
    let object = normalize_envelope(object);
    let tag = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing `type` tag".into()))?
        .to_string();
    Ok((object, tag))
}

/// Decode a client→server frame.
///
/// # Errors
/// [`DecodeError::UnknownType`] for a well-formed frame with an unknown tag,
/// [`DecodeError::Malformed`] for anything else that fails to parse.
pub fn decode_client(text: &str) -> Result<ClientMessage, DecodeError> {
    let (object, tag) = parse_object(text)?;
    if !MessageTypes::CLIENT_TYPES.contains(&tag.as_str()) {
        return Err(DecodeError::UnknownType(tag));
    }
    serde_json::from_value(Value::Object(object)).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Decode a server→client frame.
///
/// # Errors
/// Same classification as [`decode_client`].
pub fn decode_server(text: &str) -> Result<Envelope, DecodeError> {
    let (object, tag) = parse_object(text)?;
    if !MessageTypes::SERVER_TYPES.contains(&tag.as_str()) {
        return Err(DecodeError::UnknownType(tag));
    }
    serde_json::from_value(Value::Object(object)).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Encode a client→server message.
///
/// # Errors
/// Returns [`SyncError::Json`] if serialization fails.
pub fn encode_client(message: &ClientMessage) -> Result<String, SyncError> {
    Ok(serde_json::to_string(message)?)
}

/// Encode a server→client message.
///
/// # Errors
/// Returns [`SyncError::Json`] if serialization fails.
pub fn encode_server(envelope: &Envelope) -> Result<String, SyncError> {
    Ok(serde_json::to_string(envelope)?)
}

//! JSON envelope codec.
//!
//! Wire format: one JSON object per WebSocket frame,
//! `{"type": "<kind>", "payload": <any json>}`.
//! The codec never validates the payload; handlers do that.

use crate::error::{ParleyError, ParleyResult};
use crate::messages::{Envelope, WrappedPayload};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Encode an envelope into a JSON text frame.
pub fn encode(envelope: &Envelope) -> ParleyResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a frame into an envelope. Unknown kinds decode successfully.
pub fn decode(data: &[u8]) -> ParleyResult<Envelope> {
    Ok(serde_json::from_slice(data)?)
}

/// Decode an envelope's payload into the shape a handler expects.
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> ParleyResult<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        ParleyError::InvalidMessage(format!("bad {} payload: {e}", envelope.kind))
    })
}

/// Decode a `{"payload": <T>}` wrapper whose inner value may itself be a
/// JSON-encoded string.
pub fn decode_wrapped<T: DeserializeOwned>(envelope: &Envelope) -> ParleyResult<T> {
    let wrapped: WrappedPayload = decode_payload(envelope)?;
    let inner = match wrapped.payload {
        Value::String(s) => serde_json::from_str(&s),
        other => serde_json::from_value(other),
    };
    inner.map_err(|e| ParleyError::InvalidMessage(format!("bad {} payload: {e}", envelope.kind)))
}

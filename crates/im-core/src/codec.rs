//! JSON codec for bus envelopes.
//!
//! Wire format: one JSON object per WebSocket frame.

use crate::envelope::Envelope;
use crate::error::ImResult;

/// Encode an envelope as a JSON string.
pub fn encode_envelope(envelope: &Envelope) -> ImResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode an envelope from JSON bytes (text or binary frame contents).
pub fn decode_envelope(data: &[u8]) -> ImResult<Envelope> {
    Ok(serde_json::from_slice(data)?)
}

//! Codec for encoding/decoding signals

use crate::signal::{Signal, SIGNAL_TAGS};
use crate::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown signal type: {0:?}")]
    UnknownSignalType(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("Empty frame")]
    EmptyFrame,
}

/// Envelope used to inspect the tag before decoding the payload
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
}

/// Signal codec
///
/// Format: `[length: u64 little-endian][payload: JSON {"Type", "Payload"}]`
pub struct SignalCodec;

impl SignalCodec {
    /// Encode a signal into a complete frame (length prefix included)
    pub fn encode(signal: &Signal) -> Result<Bytes, CodecError> {
        let payload = Self::encode_payload(signal)?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u64_le(payload.len() as u64);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Serialize the payload of a frame
    fn encode_payload(signal: &Signal) -> Result<Vec<u8>, CodecError> {
        let payload = serde_json::to_vec(signal)?;
        Self::check_length(payload.len() as u64)?;
        Ok(payload)
    }

    /// Validate a length prefix and convert it to a buffer size
    pub fn check_length(length: u64) -> Result<usize, CodecError> {
        if length == 0 {
            return Err(CodecError::EmptyFrame);
        }
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }
        Ok(length as usize)
    }

    /// Decode the payload of one frame
    pub fn decode_payload(payload: &[u8]) -> Result<Signal, CodecError> {
        let envelope: Envelope = serde_json::from_slice(payload)?;

        if !SIGNAL_TAGS.contains(&envelope.kind.as_str()) {
            return Err(CodecError::UnknownSignalType(envelope.kind));
        }

        Ok(serde_json::from_slice(payload)?)
    }
}

//! Length-prefixed JSON framing.
//!
//! ```text
//! [0..4] : payload length (u32 BE, 1..=MAX_FRAME_LEN)
//! [4..]  : UTF-8 JSON object (one `Frame`)
//! ```
//!
//! This module only turns frames into bytes and back; reading the length
//! prefix off a socket is the transport's job (see `frame_len`).

use std::fmt;

use crate::wire_types::{Frame, MAX_FRAME_LEN};

/// Errors that can arise when encoding/decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Zero-length frame.
    Empty,
    /// Declared length above `MAX_FRAME_LEN`.
    TooLarge(usize),
    /// Payload is not a valid frame.
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "Empty frame"),
            ProtocolError::TooLarge(len) => {
                write!(f, "Frame too large: {} bytes (max {})", len, MAX_FRAME_LEN)
            }
            ProtocolError::Malformed(msg) => write!(f, "Malformed frame: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Append a length-prefixed encoding of `frame` to `out`.
pub fn encode_frame(frame: &Frame, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let payload =
        serde_json::to_vec(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    out.reserve(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Decode one frame payload (without its length prefix).
pub fn decode_frame(payload: &[u8]) -> Result<Frame, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::Empty);
    }
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Validate a length prefix and return the payload length it announces.
pub fn frame_len(header: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(ProtocolError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge(len));
    }
    Ok(len)
}

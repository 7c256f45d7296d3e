//! hub-protocol
//!
//! Wire-level encoding/decoding between the front end, the control plane
//! and shard workers.
//!
//! - [`wire_types`] : handshake and RPC frames, object references
//! - [`json_codec`] : length-prefixed JSON framing

pub mod json_codec;
pub mod wire_types;

pub use json_codec::{decode_frame, encode_frame, frame_len, ProtocolError};
pub use wire_types::{
    CallId, ControlFrame, ErrorFrame, Frame, ObjectRef, RpcId, MAX_FRAME_LEN, RPC_ID_KEY,
};

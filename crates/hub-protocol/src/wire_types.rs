//! Wire types shared by every connection in the hub.
//!
//! Every frame is a JSON object. Frames carrying a `control` field are
//! either handshake frames (`master`, `direct`, `auth`, `ready`) or RPC
//! frames (`call`, `reply`, `free`). A frame without `control` but with an
//! `error` field reports a handshake failure:
//!
//! ```text
//! front end -> worker   {"control":"auth","token":"..."}            (optional)
//! front end -> worker   {"control":"master"}
//! worker -> front end   {"control":"ready","rpcId":1}
//!
//! front end -> worker   {"control":"direct","target":42,"replyId":1}
//! worker -> front end   {"control":"call","id":1,"obj":1,"method":"ready","params":[...]}
//!
//! worker -> front end   {"error":"invalid authentication token"}
//! ```
//!
//! Objects travel inside `params` and `reply` as `{"$rpcId": n}`.

use hub_core::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of an object exported on one side of a connection.
pub type RpcId = u64;

/// Identifier matching a `call` with its `reply`.
pub type CallId = u64;

/// Largest payload accepted on a connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Key marking an object reference inside a JSON value.
pub const RPC_ID_KEY: &str = "$rpcId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Open a control channel to the worker's engine manager.
    Master,

    /// Ask for a direct connection to `target`'s engine; the worker answers
    /// by calling `ready` (or `error`) on object `reply_id`.
    Direct {
        target: UserId,
        #[serde(rename = "replyId")]
        reply_id: RpcId,
    },

    /// Shared-secret authentication, sent before any other frame.
    Auth { token: String },

    /// The object at `rpc_id` is ready to be called.
    Ready {
        #[serde(rename = "rpcId")]
        rpc_id: RpcId,
    },

    Call {
        id: CallId,
        obj: RpcId,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
    },

    Reply {
        id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// The peer released its proxy for `obj`.
    Free { obj: RpcId },
}

impl ControlFrame {
    /// Whether this frame belongs to the RPC layer rather than the handshake.
    pub fn is_rpc(&self) -> bool {
        matches!(
            self,
            ControlFrame::Call { .. } | ControlFrame::Reply { .. } | ControlFrame::Free { .. }
        )
    }
}

/// Handshake failure reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Any frame that can appear on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Control(ControlFrame),
    Error(ErrorFrame),
}

impl From<ControlFrame> for Frame {
    fn from(frame: ControlFrame) -> Self {
        Frame::Control(frame)
    }
}

impl From<ErrorFrame> for Frame {
    fn from(frame: ErrorFrame) -> Self {
        Frame::Error(frame)
    }
}

/// Reference to an exported object, as it appears inside call params.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "$rpcId")]
    pub id: RpcId,
}

impl ObjectRef {
    pub fn new(id: RpcId) -> Self {
        ObjectRef { id }
    }

    pub fn to_value(self) -> Value {
        serde_json::json!({ RPC_ID_KEY: self.id })
    }

    /// Extract a reference from `value`, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.as_object()?.get(RPC_ID_KEY)?.as_u64()?;
        Some(ObjectRef { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_frames_match_documented_shape() {
        let direct = Frame::from(ControlFrame::Direct {
            target: UserId::Numeric(42),
            reply_id: 3,
        });
        assert_eq!(
            serde_json::to_value(&direct).unwrap(),
            json!({"control": "direct", "target": 42, "replyId": 3})
        );

        let master = serde_json::to_value(Frame::from(ControlFrame::Master)).unwrap();
        assert_eq!(master, json!({"control": "master"}));

        let ready: Frame = serde_json::from_value(json!({"control": "ready", "rpcId": 9})).unwrap();
        assert_eq!(ready, Frame::Control(ControlFrame::Ready { rpc_id: 9 }));
    }

    #[test]
    fn error_frame_is_recognised_without_control() {
        let frame: Frame =
            serde_json::from_value(json!({"error": "expected authentication"})).unwrap();
        assert_eq!(
            frame,
            Frame::Error(ErrorFrame {
                error: "expected authentication".into(),
                code: None
            })
        );
    }

    #[test]
    fn reply_error_stays_a_control_frame() {
        let frame: Frame = serde_json::from_value(
            json!({"control": "reply", "id": 4, "error": "boom", "code": "EIO"}),
        )
        .unwrap();
        match frame {
            Frame::Control(ControlFrame::Reply { id, reply, error, code }) => {
                assert_eq!(id, 4);
                assert!(reply.is_none());
                assert_eq!(error.as_deref(), Some("boom"));
                assert_eq!(code.as_deref(), Some("EIO"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn object_refs() {
        let value = ObjectRef::new(12).to_value();
        assert_eq!(value, json!({"$rpcId": 12}));
        assert_eq!(ObjectRef::from_value(&value), Some(ObjectRef::new(12)));
        assert_eq!(ObjectRef::from_value(&json!({"id": 12})), None);
        assert_eq!(ObjectRef::from_value(&json!(12)), None);
    }

    #[test]
    fn unknown_control_is_rejected() {
        let res: Result<Frame, _> = serde_json::from_value(json!({"control": "new-object"}));
        assert!(res.is_err());
    }
}

//! Wire message types.
//!
//! All communication between modules uses JSON-framed messages. Each frame is
//! prefixed with a 4-byte big-endian length header.

use crate::WireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID. Command results reuse the ID of their call.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// A command invocation, answered on `reply_to`.
    #[serde(rename = "cmd_call")]
    Call(CommandCall),
    /// The answer to a command invocation.
    #[serde(rename = "cmd_result")]
    Result(CommandResult),
    /// A published variable value (no response expected).
    #[serde(rename = "var")]
    Var(VarUpdate),
    /// A module announces that it finished its ready hook.
    #[serde(rename = "ready")]
    Ready { module_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCall {
    /// Module id of the caller.
    pub origin: String,
    /// Topic the result must be published on.
    pub reply_to: String,
    /// Call arguments.
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Return value of the handler; `null` when it failed.
    #[serde(default)]
    pub retval: Value,
    /// Set when the handler failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(retval: Value) -> Self {
        Self {
            retval,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            retval: Value::Null,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarUpdate {
    /// Module id of the publisher.
    pub origin: String,
    /// Per-publisher sequence number, starting at 0.
    pub seq: u64,
    pub data: Value,
}

/// Maximum single frame body size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, WireError> {
    Ok(serde_json::from_slice(body)?)
}

/// Decode a complete frame (header + body).
pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, WireError> {
    let (header, body) = match frame {
        [a, b, c, d, body @ ..] => ([*a, *b, *c, *d], body),
        _ => {
            return Err(WireError::Truncated {
                announced: 4,
                actual: frame.len(),
            })
        }
    };
    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if body.len() != len as usize {
        return Err(WireError::Truncated {
            announced: len,
            actual: body.len(),
        });
    }
    decode_message(body)
}

/// Topic layout shared by all modules on a broker.
pub mod topic {
    /// Topic a module listens on for calls to one of its commands.
    pub fn cmd(prefix: &str, module_id: &str, implementation_id: &str, name: &str) -> String {
        format!("{prefix}{module_id}/{implementation_id}/cmd/{name}")
    }

    /// Topic a module publishes one of its variables on.
    pub fn var(prefix: &str, module_id: &str, implementation_id: &str, name: &str) -> String {
        format!("{prefix}{module_id}/{implementation_id}/var/{name}")
    }

    /// Private topic the result of one call is delivered on.
    pub fn reply(prefix: &str, module_id: &str, call_id: &str) -> String {
        format!("{prefix}{module_id}/reply/{call_id}")
    }

    /// Topic readiness announcements are broadcast on.
    pub fn ready(prefix: &str) -> String {
        format!("{prefix}ready")
    }
}

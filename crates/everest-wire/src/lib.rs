//! Everest wire layer: framed messages between modules.
//!
//! Modules never talk to each other directly. Every command call, command
//! result, variable update and readiness announcement is a [`WireMessage`]
//! encoded as a length-prefixed JSON frame and published on a topic of a
//! [`Broker`].
//!
//! ## Architecture
//!
//! - **WireMessage**: JSON envelope with a unique id and a typed payload
//! - **topic**: builders for the topic layout shared by all modules
//! - **Broker**: process-wide, endpoint-keyed topic fan-out

pub mod broker;
pub mod message;

pub use broker::{Broker, Delivery};
pub use message::{
    decode_frame, encode_message, topic, CommandCall, CommandResult, VarUpdate, WireMessage,
    WireMessageKind,
};

use everest_types::EverestError;
use thiserror::Error;

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Truncated frame: header announces {announced} bytes, {actual} present")]
    Truncated { announced: u32, actual: usize },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("No subscriber on topic '{0}'")]
    NoSubscribers(String),
}

impl From<WireError> for EverestError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Json(e) => EverestError::Marshal(e.to_string()),
            other => EverestError::Transport(other.to_string()),
        }
    }
}

//! Wire documents: the byte form of a structured document at the boundary.
//!
//! The framework side works with [`serde_json::Value`]; module implementations
//! work with whatever their own types serialize to. Neither side ever sees the
//! other's representation: every crossing goes through a [`WireDocument`],
//! which owns a UTF-8 JSON byte buffer and is copied by value.

use crate::error::{EverestError, EverestResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// An owned UTF-8 JSON document as it crosses the module boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDocument {
    data: Vec<u8>,
}

impl WireDocument {
    /// Wrap raw bytes as handed over by the other side.
    ///
    /// The bytes are not validated here; a malformed buffer surfaces as a
    /// [`EverestError::Marshal`] the moment it is parsed.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Serialize a native document.
    pub fn from_native(value: &Value) -> EverestResult<Self> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
        })
    }

    /// Parse back into a native document.
    pub fn to_native(&self) -> EverestResult<Value> {
        serde_json::from_slice(&self.data).map_err(|e| {
            EverestError::Marshal(format!("malformed wire document ({} bytes): {e}", self.len()))
        })
    }

    /// Serialize any serde type directly.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> EverestResult<Self> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
        })
    }

    /// Deserialize into any serde type directly.
    pub fn deserialize<T: DeserializeOwned>(&self) -> EverestResult<T> {
        serde_json::from_slice(&self.data).map_err(|e| EverestError::Marshal(e.to_string()))
    }

    /// The JSON `null` document.
    pub fn null() -> Self {
        Self {
            data: b"null".to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for WireDocument {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl fmt::Display for WireDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

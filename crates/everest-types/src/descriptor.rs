//! Endpoint descriptors and peer references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names one command or variable endpoint: an implementation (or, on the
/// consuming side, a requirement) plus the command/variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub implementation_id: String,
    pub name: String,
}

impl Descriptor {
    pub fn new(implementation_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            implementation_id: implementation_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.implementation_id, self.name)
    }
}

/// A requirement resolved to one of its connection slots.
///
/// Only slot 0 is ever produced by the bridge itself. How several peers bound
/// to the same requirement should be addressed is undefined upstream, so no
/// fan-out or selection policy exists; other slots are only reachable by
/// constructing the reference explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub implementation_id: String,
    pub slot: usize,
}

impl PeerRef {
    pub const DEFAULT_SLOT: usize = 0;

    pub fn new(implementation_id: impl Into<String>) -> Self {
        Self::with_slot(implementation_id, Self::DEFAULT_SLOT)
    }

    pub fn with_slot(implementation_id: impl Into<String>, slot: usize) -> Self {
        Self {
            implementation_id: implementation_id.into(),
            slot,
        }
    }
}

impl From<&Descriptor> for PeerRef {
    fn from(meta: &Descriptor) -> Self {
        PeerRef::new(meta.implementation_id.clone())
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.implementation_id, self.slot)
    }
}

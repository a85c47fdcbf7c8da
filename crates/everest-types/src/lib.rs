//! Core types for the everest module bridge.
//!
//! This crate defines the data structures that cross the boundary between a
//! module implementation and the framework runtime: wire documents, endpoint
//! descriptors, peer references, the manifest/interface schema and the error
//! taxonomy. It contains no business logic.

pub mod descriptor;
pub mod document;
pub mod error;
pub mod schema;

pub use descriptor::{Descriptor, PeerRef};
pub use document::WireDocument;
pub use error::{EverestError, EverestResult};

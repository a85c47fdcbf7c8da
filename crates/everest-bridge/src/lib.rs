//! Everest module bridge.
//!
//! Lets module code take part in an everest deployment. A [`ModuleBridge`]
//! owns the framework runtime handle of one module and moves opaque
//! [`WireDocument`]s across three interaction patterns:
//!
//! - commands: provide a handler, or call a peer and block for its reply;
//! - variables: subscribe to a peer's updates, or publish your own;
//! - lifecycle: initialize, then signal readiness once.
//!
//! Framework events reach module code through a [`CallbackSurface`]. The
//! higher-level [`Runtime`] wires a whole manifest to one [`Subscriber`].

pub mod args;
pub mod callbacks;
pub mod module;
pub mod runtime;

pub use args::ModuleArgs;
pub use callbacks::CallbackSurface;
pub use everest_types::{Descriptor, EverestError, EverestResult, PeerRef, WireDocument};
pub use module::ModuleBridge;
pub use runtime::{Runtime, Subscriber};

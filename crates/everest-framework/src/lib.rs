//! Everest framework runtime.
//!
//! Everything a module process needs below the bridge surface: settings
//! resolution, the configuration object with its manifests and interfaces,
//! process-wide logging and the [`Everest`] runtime handle that moves
//! commands, variables and readiness over the broker.

pub mod config;
pub mod logging;
pub mod runtime;
pub mod settings;

pub use config::Config;
pub use runtime::{CmdHandler, Everest, ReadyHandler, VarHandler};
pub use settings::RuntimeSettings;

//! Shared error types for the module bridge.

use thiserror::Error;

/// Top-level error type for the module bridge.
#[derive(Error, Debug)]
pub enum EverestError {
    /// The config file, a module entry, a manifest or an interface is missing
    /// or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested interface, implementation or requirement is not declared.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A wire document failed to parse, or a native document failed to serialize.
    #[error("Marshal error: {0}")]
    Marshal(String),

    /// The transport could not deliver a call, reply or publication.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote handler of a command failed to produce a reply.
    #[error("Command '{command}' failed: {reason}")]
    CallFailed {
        /// The command that was called.
        command: String,
        /// The failure reported by the providing module.
        reason: String,
    },

    /// A command was invoked without a required argument.
    #[error("Missing argument to command call: '{0}'")]
    MissingArgument(String),

    /// A command was invoked with an argument of the wrong shape.
    #[error("Invalid argument to command call: '{0}'")]
    InvalidArgument(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EverestError {
    fn from(e: serde_json::Error) -> Self {
        EverestError::Marshal(e.to_string())
    }
}

/// Alias for Result with EverestError.
pub type EverestResult<T> = Result<T, EverestError>;

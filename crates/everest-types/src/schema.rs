//! Typed views of the framework's configuration documents.
//!
//! The framework keeps manifests and interfaces as native documents; these
//! types are what both sides deserialize them into when they need structure.
//! Unknown keys are ignored so that documents carrying more than the bridge
//! needs (config schemas, metadata, type refs) still load.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A module manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub description: String,
    /// Implementations this module provides, by implementation id.
    #[serde(default)]
    pub provides: BTreeMap<String, ImplementationDecl>,
    /// Requirements this module consumes, by requirement id.
    #[serde(default)]
    pub requires: BTreeMap<String, RequirementDecl>,
}

/// One entry of a manifest's `provides` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationDecl {
    pub interface: String,
    #[serde(default)]
    pub description: String,
}

/// One entry of a manifest's `requires` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementDecl {
    pub interface: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    1
}

/// An interface definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cmds: BTreeMap<String, CommandDecl>,
    #[serde(default)]
    pub vars: BTreeMap<String, VariableDecl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandDecl {
    #[serde(default)]
    pub description: String,
    /// Argument schemas by argument name. Opaque to the bridge.
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(default)]
    pub description: String,
    /// The remaining JSON-schema keys of the variable.
    #[serde(flatten)]
    pub schema: BTreeMap<String, Value>,
}

/// An entry of the main configuration's `active_modules` mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveModule {
    /// The declared module type; selects the manifest.
    pub module: String,
    /// Requirement id → peers bound to it, in slot order.
    #[serde(default)]
    pub connections: BTreeMap<String, Vec<Connection>>,
}

/// A binding of a requirement slot to a peer module's implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub module_id: String,
    pub implementation_id: String,
}

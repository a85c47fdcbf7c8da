//! Configuration object: main config, manifests and interfaces.
//!
//! Loading follows the references outward from the config file: every
//! active module names a module type, every module type has a manifest, and
//! every manifest names the interfaces it provides and requires. Documents
//! are kept in their native form; typed views are built on demand.
//!
//! A manifest file that does not exist is tolerated at load time and reported
//! when a module asks for it, so that a config listing modules that are not
//! installed still loads for the modules that are. Anything that exists but
//! is malformed fails the load.

use crate::settings::RuntimeSettings;
use everest_types::schema::{ActiveModule, Connection, Interface, Manifest};
use everest_types::{EverestError, EverestResult, PeerRef};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Parse a YAML file into a native document.
pub fn load_yaml(path: &Path) -> EverestResult<Value> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        EverestError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_yaml::from_str::<Value>(&contents)
        .map_err(|e| EverestError::Configuration(format!("malformed {}: {e}", path.display())))
}

#[derive(Debug, Default, Deserialize)]
struct MainConfigFile {
    #[serde(default)]
    active_modules: BTreeMap<String, Value>,
}

/// The schema-checked configuration shared by the runtime and the bridge.
#[derive(Debug, Clone)]
pub struct Config {
    main: BTreeMap<String, ActiveModule>,
    /// Module type → manifest document.
    manifests: BTreeMap<String, Value>,
    /// Module type → typed manifest, parsed once at load.
    typed_manifests: BTreeMap<String, Manifest>,
    /// Interface name → interface document.
    interfaces: BTreeMap<String, Value>,
}

impl Config {
    /// Load the config file named by `settings` and everything it references.
    pub fn load(settings: &RuntimeSettings) -> EverestResult<Self> {
        let root = load_yaml(&settings.config_file)?;
        let file: MainConfigFile = if root.is_null() {
            MainConfigFile::default()
        } else {
            serde_json::from_value(root).map_err(|e| {
                EverestError::Configuration(format!(
                    "malformed main config in {}: {e}",
                    settings.config_file.display()
                ))
            })?
        };

        let mut main = BTreeMap::new();
        for (module_id, entry) in file.active_modules {
            let module: ActiveModule = serde_json::from_value(entry).map_err(|e| {
                EverestError::Configuration(format!("malformed entry for module '{module_id}': {e}"))
            })?;
            main.insert(module_id, module);
        }

        let module_types: BTreeSet<&str> = main.values().map(|m| m.module.as_str()).collect();
        let mut manifests = BTreeMap::new();
        let mut typed_manifests = BTreeMap::new();
        let mut wanted_interfaces = BTreeSet::new();
        for module_type in module_types {
            let path = settings.manifest_path(module_type);
            if !path.exists() {
                warn!(module_type, path = %path.display(), "Manifest not found");
                continue;
            }
            let doc = load_yaml(&path)?;
            let manifest: Manifest = serde_json::from_value(doc.clone()).map_err(|e| {
                EverestError::Configuration(format!("malformed manifest of '{module_type}': {e}"))
            })?;
            wanted_interfaces.extend(manifest.provides.values().map(|p| p.interface.clone()));
            wanted_interfaces.extend(manifest.requires.values().map(|r| r.interface.clone()));
            manifests.insert(module_type.to_string(), doc);
            typed_manifests.insert(module_type.to_string(), manifest);
        }

        let mut interfaces = BTreeMap::new();
        for name in wanted_interfaces {
            let path = settings.interface_path(&name);
            let doc = load_yaml(&path)?;
            serde_json::from_value::<Interface>(doc.clone()).map_err(|e| {
                EverestError::Configuration(format!("malformed interface '{name}': {e}"))
            })?;
            debug!(interface = %name, "Loaded interface");
            interfaces.insert(name, doc);
        }

        info!(
            path = %settings.config_file.display(),
            modules = main.len(),
            manifests = manifests.len(),
            interfaces = interfaces.len(),
            "Loaded configuration"
        );
        Ok(Self {
            main,
            manifests,
            typed_manifests,
            interfaces,
        })
    }

    /// Module id → active module entry.
    pub fn get_main_config(&self) -> &BTreeMap<String, ActiveModule> {
        &self.main
    }

    /// Module type → manifest document.
    pub fn get_manifests(&self) -> &BTreeMap<String, Value> {
        &self.manifests
    }

    pub fn get_interface_definition(&self, name: &str) -> EverestResult<&Value> {
        self.interfaces
            .get(name)
            .ok_or_else(|| EverestError::NotFound(format!("interface '{name}' is not declared")))
    }

    /// The declared type of an active module.
    pub fn module_type(&self, module_id: &str) -> EverestResult<&str> {
        self.main
            .get(module_id)
            .map(|m| m.module.as_str())
            .ok_or_else(|| {
                EverestError::Configuration(format!(
                    "module '{module_id}' is not in the main configuration"
                ))
            })
    }

    /// The manifest document of an active module.
    pub fn manifest_document(&self, module_id: &str) -> EverestResult<&Value> {
        let module_type = self.module_type(module_id)?;
        self.manifests.get(module_type).ok_or_else(|| {
            EverestError::Configuration(format!(
                "no manifest for module type '{module_type}' of module '{module_id}'"
            ))
        })
    }

    /// The typed manifest of an active module.
    pub fn manifest(&self, module_id: &str) -> EverestResult<&Manifest> {
        let module_type = self.module_type(module_id)?;
        self.typed_manifests.get(module_type).ok_or_else(|| {
            EverestError::Configuration(format!(
                "no manifest for module type '{module_type}' of module '{module_id}'"
            ))
        })
    }

    /// Whether an active module provides `implementation_id`.
    pub fn provides(&self, module_id: &str, implementation_id: &str) -> EverestResult<bool> {
        Ok(self
            .manifest(module_id)?
            .provides
            .contains_key(implementation_id))
    }

    /// Resolve a requirement slot of `module_id` to the peer bound to it.
    pub fn resolve_requirement(&self, module_id: &str, peer: &PeerRef) -> EverestResult<&Connection> {
        let module = self.main.get(module_id).ok_or_else(|| {
            EverestError::Configuration(format!(
                "module '{module_id}' is not in the main configuration"
            ))
        })?;
        module
            .connections
            .get(&peer.implementation_id)
            .and_then(|slots| slots.get(peer.slot))
            .ok_or_else(|| {
                EverestError::NotFound(format!(
                    "module '{module_id}' has no connection for requirement {peer}"
                ))
            })
    }
}

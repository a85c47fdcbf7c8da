//! Runtime: the module SDK entry point.
//!
//! Deals in command names and native documents, but knows nothing about a
//! particular module: [`Runtime::set_subscriber`] reads the module's
//! manifest and routes every declared command and variable to one
//! [`Subscriber`]. Strongly typed module code is expected to sit on top.

use crate::args::ModuleArgs;
use crate::callbacks::CallbackSurface;
use crate::module::ModuleBridge;
use clap::Parser;
use everest_types::schema::{Interface, Manifest};
use everest_types::{Descriptor, EverestError, EverestResult, WireDocument};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Module-side handler of commands, variables and readiness.
pub trait Subscriber: Send + Sync {
    /// Serve command `name` of implementation `implementation_id`. The return
    /// value is the result of the call.
    fn handle_command(
        &self,
        implementation_id: &str,
        name: &str,
        parameters: HashMap<String, Value>,
    ) -> EverestResult<Value>;

    /// Receive variable `name` of requirement `implementation_id`.
    fn handle_variable(&self, implementation_id: &str, name: &str, value: Value)
        -> EverestResult<()>;

    fn on_ready(&self) {}
}

/// Adapts a weakly held [`Subscriber`] to the bridge's callback surface.
struct SubscriberSurface {
    subscriber: Weak<dyn Subscriber>,
}

impl SubscriberSurface {
    fn subscriber(&self) -> EverestResult<Arc<dyn Subscriber>> {
        self.subscriber
            .upgrade()
            .ok_or_else(|| EverestError::Internal("subscriber dropped".to_string()))
    }
}

impl CallbackSurface for SubscriberSurface {
    fn on_ready(&self) {
        match self.subscriber() {
            Ok(subscriber) => subscriber.on_ready(),
            Err(e) => warn!(error = %e, "Ready signal not delivered"),
        }
    }

    fn handle_command(
        &self,
        descriptor: &Descriptor,
        args: WireDocument,
    ) -> EverestResult<WireDocument> {
        let parameters: HashMap<String, Value> = match args.to_native()? {
            Value::Null => HashMap::new(),
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(EverestError::InvalidArgument(format!(
                    "arguments of {descriptor} must be an object, got {other}"
                )))
            }
        };
        let retval = self.subscriber()?.handle_command(
            &descriptor.implementation_id,
            &descriptor.name,
            parameters,
        )?;
        WireDocument::from_native(&retval)
    }

    fn handle_variable(&self, descriptor: &Descriptor, value: WireDocument) -> EverestResult<()> {
        self.subscriber()?.handle_variable(
            &descriptor.implementation_id,
            &descriptor.name,
            value.to_native()?,
        )
    }
}

/// Owns the module bridge of this process.
///
/// The subscriber is held weakly: module code commonly owns the runtime from
/// inside its subscriber, and a strong reference here would keep both alive
/// forever.
pub struct Runtime {
    bridge: ModuleBridge,
    /// Outcome of the first `set_subscriber`.
    setup: Mutex<Option<Result<(), String>>>,
}

impl Runtime {
    pub fn new(args: &ModuleArgs) -> EverestResult<Self> {
        let bridge = ModuleBridge::new(
            &args.module,
            &args.prefix.to_string_lossy(),
            &args.conf.to_string_lossy(),
        )?;
        Ok(Self {
            bridge,
            setup: Mutex::new(None),
        })
    }

    /// Build the runtime from the process arguments.
    pub fn from_args() -> EverestResult<Self> {
        Self::new(&ModuleArgs::parse())
    }

    pub fn bridge(&self) -> &ModuleBridge {
        &self.bridge
    }

    /// Initialize the module and route everything its manifest declares to
    /// `subscriber`, then signal readiness.
    ///
    /// Only the first call has effect. If it failed, later calls fail too:
    /// part of the manifest may already be registered.
    pub fn set_subscriber(&self, subscriber: Weak<dyn Subscriber>) -> EverestResult<()> {
        let mut setup = self.setup.lock().unwrap_or_else(|e| e.into_inner());
        match setup.as_ref() {
            Some(Ok(())) => return Ok(()),
            Some(Err(reason)) => {
                return Err(EverestError::Internal(format!(
                    "subscriber setup already failed: {reason}"
                )))
            }
            None => {}
        }
        let outcome = self.wire_subscriber(subscriber);
        *setup = Some(outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn wire_subscriber(&self, subscriber: Weak<dyn Subscriber>) -> EverestResult<()> {
        let surface: Arc<dyn CallbackSurface> = Arc::new(SubscriberSurface { subscriber });
        let manifest: Manifest = self.bridge.initialize()?.deserialize()?;

        for (implementation_id, implementation) in &manifest.provides {
            let interface: Interface = self
                .bridge
                .get_interface(&implementation.interface)?
                .deserialize()?;
            for name in interface.cmds.keys() {
                self.bridge.provide_command(
                    Arc::clone(&surface),
                    &Descriptor::new(implementation_id, name),
                )?;
            }
        }

        let module_id = self.bridge.module_id();
        let connections = self
            .bridge
            .config()
            .get_main_config()
            .get(module_id)
            .map(|m| &m.connections);
        for (requirement_id, requirement) in &manifest.requires {
            let connected = connections
                .and_then(|c| c.get(requirement_id))
                .is_some_and(|slots| !slots.is_empty());
            if !connected && requirement.min_connections == 0 {
                debug!(module = module_id, requirement = %requirement_id, "Optional requirement not connected");
                continue;
            }
            let interface: Interface = self
                .bridge
                .get_interface(&requirement.interface)?
                .deserialize()?;
            for name in interface.vars.keys() {
                self.bridge.subscribe_variable(
                    Arc::clone(&surface),
                    &Descriptor::new(requirement_id, name),
                )?;
            }
        }

        self.bridge.signal_ready(surface)
    }

    pub fn publish_variable<T: Serialize>(
        &self,
        implementation_id: &str,
        name: &str,
        value: &T,
    ) -> EverestResult<()> {
        self.bridge
            .publish_variable(implementation_id, name, WireDocument::from_serialize(value)?)
    }

    pub fn call_command<T: Serialize, R: DeserializeOwned>(
        &self,
        implementation_id: &str,
        name: &str,
        args: &T,
    ) -> EverestResult<R> {
        self.bridge
            .call_command(implementation_id, name, WireDocument::from_serialize(args)?)?
            .deserialize()
    }
}

//! ModuleBridge: one module's view of the framework.
//!
//! Owns the runtime handle and the configuration it was loaded with and
//! converts between wire documents and native documents at every crossing.

use crate::callbacks::CallbackSurface;
use everest_framework::{logging, Config, Everest, RuntimeSettings};
use everest_types::{Descriptor, EverestResult, PeerRef, WireDocument};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ModuleBridge {
    // Declared first so it is dropped first: the handle unregisters every
    // callback before the configuration goes away.
    handle: Everest,
    config: Arc<Config>,
    settings: RuntimeSettings,
    module_id: String,
}

impl ModuleBridge {
    /// Resolve settings, load the configuration and create the runtime
    /// handle. Nothing is connected until [`ModuleBridge::initialize`].
    pub fn new(module_id: &str, prefix: &str, config_path: &str) -> EverestResult<Self> {
        let settings = RuntimeSettings::resolve(prefix, config_path)?;
        logging::init(&settings);
        let config = Arc::new(Config::load(&settings)?);
        let handle = Everest::new(module_id, Arc::clone(&config), &settings);
        debug!(module = module_id, "Module bridge created");
        Ok(Self {
            handle,
            config,
            settings,
            module_id: module_id.to_string(),
        })
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect, start the processing thread and return this module's
    /// manifest.
    pub fn initialize(&self) -> EverestResult<WireDocument> {
        let module_type = self.config.module_type(&self.module_id)?;
        let manifest = WireDocument::from_native(self.config.manifest_document(&self.module_id)?)?;
        self.handle.connect()?;
        self.handle.spawn_main_loop_thread()?;
        info!(module = %self.module_id, module_type, "Module initialized");
        Ok(manifest)
    }

    pub fn get_interface(&self, interface_name: &str) -> EverestResult<WireDocument> {
        WireDocument::from_native(self.config.get_interface_definition(interface_name)?)
    }

    /// Forward the ready signal to `callbacks` and declare the module ready.
    pub fn signal_ready(&self, callbacks: Arc<dyn CallbackSurface>) -> EverestResult<()> {
        self.handle
            .register_on_ready_handler(Arc::new(move || callbacks.on_ready()));
        self.handle.signal_ready()
    }

    /// Serve the command named by `descriptor` through `callbacks`.
    pub fn provide_command(
        &self,
        callbacks: Arc<dyn CallbackSurface>,
        descriptor: &Descriptor,
    ) -> EverestResult<()> {
        let desc = descriptor.clone();
        self.handle.provide_cmd(
            &descriptor.implementation_id,
            &descriptor.name,
            Arc::new(move |args| {
                let reply = callbacks.handle_command(&desc, WireDocument::from_native(&args)?)?;
                // A reply that does not parse fails this call only.
                reply.to_native()
            }),
        )
    }

    /// Call `name` on the peer bound to requirement `implementation_id`.
    pub fn call_command(
        &self,
        implementation_id: &str,
        name: &str,
        args: WireDocument,
    ) -> EverestResult<WireDocument> {
        self.call_command_at(&PeerRef::new(implementation_id), name, args)
    }

    /// Call `name` on the peer bound to an explicit requirement slot.
    pub fn call_command_at(
        &self,
        peer: &PeerRef,
        name: &str,
        args: WireDocument,
    ) -> EverestResult<WireDocument> {
        let reply = self.handle.call_cmd(peer, name, args.to_native()?)?;
        WireDocument::from_native(&reply)
    }

    /// Deliver updates of the variable named by `descriptor` to `callbacks`.
    /// `descriptor.implementation_id` names a requirement.
    pub fn subscribe_variable(
        &self,
        callbacks: Arc<dyn CallbackSurface>,
        descriptor: &Descriptor,
    ) -> EverestResult<()> {
        let desc = descriptor.clone();
        self.handle.subscribe_var(
            &PeerRef::from(descriptor),
            &descriptor.name,
            Arc::new(move |value| {
                let delivered = WireDocument::from_native(&value)
                    .and_then(|doc| callbacks.handle_variable(&desc, doc));
                if let Err(e) = delivered {
                    warn!(variable = %desc, error = %e, "Variable handler failed");
                }
            }),
        )
    }

    pub fn publish_variable(
        &self,
        implementation_id: &str,
        name: &str,
        value: WireDocument,
    ) -> EverestResult<()> {
        self.handle
            .publish_var(implementation_id, name, value.to_native()?)
    }

    /// Whether module `module_id` announced readiness.
    pub fn is_peer_ready(&self, module_id: &str) -> bool {
        self.handle.is_peer_ready(module_id)
    }
}

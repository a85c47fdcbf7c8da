//! The entry points a module implementation exposes to the bridge.

use everest_types::{Descriptor, EverestResult, WireDocument};

/// Receiver of framework events for one module.
///
/// The bridge shares one `Arc<dyn CallbackSurface>` between all
/// registrations made with it; the surface stays alive until the module
/// bridge is dropped. Commands arrive on handler threads and may overlap;
/// variable updates and the ready signal arrive one at a time on the
/// module's processing thread.
pub trait CallbackSurface: Send + Sync {
    /// Called once, before peers see this module as ready.
    fn on_ready(&self) {}

    /// Serve one call of the command named by `descriptor`. The returned
    /// document becomes the caller's reply.
    fn handle_command(
        &self,
        descriptor: &Descriptor,
        args: WireDocument,
    ) -> EverestResult<WireDocument>;

    /// Receive one update of the variable named by `descriptor`.
    fn handle_variable(&self, descriptor: &Descriptor, value: WireDocument) -> EverestResult<()>;
}

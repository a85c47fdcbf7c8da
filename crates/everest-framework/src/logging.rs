//! Process-wide tracing setup.

use crate::settings::RuntimeSettings;
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the tracing subscriber once per process.
///
/// `RUST_LOG` wins over the configured filter. A subscriber installed by the
/// host application (or a test harness) before this call is left in place.
pub fn init(settings: &RuntimeSettings) {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_filter));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        if installed.is_ok() {
            tracing::debug!(filter = %settings.log_filter, "Logging initialized");
        }
    });
}

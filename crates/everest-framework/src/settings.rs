//! Runtime settings resolved from the installation prefix and the config file.
//!
//! The config file may carry a `settings` table that overrides any of the
//! defaults below. Relative directories in that table resolve against the
//! directory holding the config file.

use everest_types::{EverestError, EverestResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "etc/everest/default.yaml";
pub const DEFAULT_BROKER_HOST: &str = "localhost";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_EVEREST_PREFIX: &str = "everest/";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Fully resolved settings of one module process.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub prefix: PathBuf,
    pub config_file: PathBuf,
    /// Holds one `<ModuleType>/manifest.yaml` per module type.
    pub modules_dir: PathBuf,
    /// Holds one `<interface>.yaml` per interface.
    pub interfaces_dir: PathBuf,
    pub mqtt_broker_host: String,
    pub mqtt_broker_port: u16,
    /// Prepended to every topic.
    pub mqtt_everest_prefix: String,
    /// How long a command call waits for its result. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsOverrides {
    modules_dir: Option<PathBuf>,
    interfaces_dir: Option<PathBuf>,
    mqtt_broker_host: Option<String>,
    mqtt_broker_port: Option<u16>,
    mqtt_everest_prefix: Option<String>,
    /// `0` disables the timeout.
    call_timeout_ms: Option<u64>,
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigHead {
    #[serde(default)]
    settings: SettingsOverrides,
}

impl RuntimeSettings {
    /// Resolve settings for an installation `prefix` and a `config_file`.
    ///
    /// An empty `config_file` selects `<prefix>/etc/everest/default.yaml`. An
    /// empty `prefix` makes the config file's directory the base for the
    /// default module and interface directories.
    pub fn resolve(prefix: &str, config_file: &str) -> EverestResult<Self> {
        let prefix = PathBuf::from(prefix);
        let config_file = if config_file.is_empty() {
            prefix.join(DEFAULT_CONFIG_FILE)
        } else {
            PathBuf::from(config_file)
        };

        let contents = std::fs::read_to_string(&config_file).map_err(|e| {
            EverestError::Configuration(format!(
                "cannot read config file {}: {e}",
                config_file.display()
            ))
        })?;
        let head: ConfigHead = if contents.trim().is_empty() {
            ConfigHead::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|e| {
                EverestError::Configuration(format!(
                    "malformed settings in {}: {e}",
                    config_file.display()
                ))
            })?
        };
        let overrides = head.settings;

        let config_dir = match config_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let relative_to_config = |p: PathBuf| {
            if p.is_absolute() {
                p
            } else {
                config_dir.join(p)
            }
        };

        let (default_modules, default_interfaces) = if prefix.as_os_str().is_empty() {
            (config_dir.join("modules"), config_dir.join("interfaces"))
        } else {
            (
                prefix.join("libexec/everest/modules"),
                prefix.join("share/everest/interfaces"),
            )
        };

        let mqtt_broker_host = match overrides.mqtt_broker_host {
            Some(host) => host,
            None => std::env::var("MQTT_SERVER_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BROKER_HOST.to_string()),
        };
        let mqtt_broker_port = match overrides.mqtt_broker_port {
            Some(port) => port,
            None => match std::env::var("MQTT_SERVER_PORT") {
                Ok(raw) => raw.parse().map_err(|e| {
                    EverestError::Configuration(format!("invalid MQTT_SERVER_PORT '{raw}': {e}"))
                })?,
                Err(_) => DEFAULT_BROKER_PORT,
            },
        };

        let call_timeout = match overrides.call_timeout_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(DEFAULT_CALL_TIMEOUT),
        };

        let settings = Self {
            modules_dir: overrides
                .modules_dir
                .map(relative_to_config)
                .unwrap_or(default_modules),
            interfaces_dir: overrides
                .interfaces_dir
                .map(relative_to_config)
                .unwrap_or(default_interfaces),
            mqtt_broker_host,
            mqtt_broker_port,
            mqtt_everest_prefix: overrides
                .mqtt_everest_prefix
                .unwrap_or_else(|| DEFAULT_EVEREST_PREFIX.to_string()),
            call_timeout,
            log_filter: overrides
                .log_filter
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            prefix,
            config_file,
        };
        debug!(
            config = %settings.config_file.display(),
            broker = %settings.broker_endpoint(),
            "Resolved runtime settings"
        );
        Ok(settings)
    }

    /// The `host:port` endpoint of the message broker.
    pub fn broker_endpoint(&self) -> String {
        format!("{}:{}", self.mqtt_broker_host, self.mqtt_broker_port)
    }

    pub fn manifest_path(&self, module_type: &str) -> PathBuf {
        self.modules_dir.join(module_type).join("manifest.yaml")
    }

    pub fn interface_path(&self, interface: &str) -> PathBuf {
        self.interfaces_dir.join(format!("{interface}.yaml"))
    }
}

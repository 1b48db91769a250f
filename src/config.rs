//! Configuration for a Synapse instance.
//!
//! Loads configuration from TOML files with environment variable substitution,
//! or is constructed programmatically by the host.
//!
//! # Example
//!
//! ```toml
//! broker_address = "mqtt://broker.internal:1883"
//! username = "${SYNAPSE_MQ_USER}"
//! password = "${SYNAPSE_MQ_PASS}"
//! sys_name = "acme"
//! app_name = "billing"
//! rpc_timeout_secs = 3
//! event_load_balancing = true
//! enable_config_store = true
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("sys_name and app_name must both be set")]
    MissingIdentity,

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Options controlling one Synapse instance.
///
/// `sys_name` scopes every topic; `app_name` is the application's logical
/// address; `app_id` identifies this process instance and defaults to a
/// fresh UUID when unset.
#[derive(Debug, Deserialize, Clone)]
pub struct SynapseConfig {
    /// Broker address as a URL. `mqtt://host:port` for plain TCP,
    /// `ws://host:port/path` for MQTT over websocket.
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// System namespace shared by every participating application.
    #[serde(default)]
    pub sys_name: String,

    /// Logical application name, used for addressing events and RPC.
    #[serde(default)]
    pub app_name: String,

    /// Unique id of this instance. Generated when not set.
    #[serde(default)]
    pub app_id: Option<String>,

    /// How long an RPC call waits for its response before a 502 is
    /// synthesized locally.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Delay between reconnect attempts after the broker connection drops.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// When set, event subscriptions are shared: each event is delivered to
    /// exactly one instance of this application instead of all of them.
    #[serde(default)]
    pub event_load_balancing: bool,

    /// When set, the retained configuration store is subscribed and
    /// `set_config`/`get_config` become operational.
    #[serde(default)]
    pub enable_config_store: bool,

    /// Disables the outbound event half; `fire_event` becomes a logged no-op.
    #[serde(default)]
    pub disable_event_client: bool,

    /// Disables the outbound RPC half; `rpc` fails fast.
    #[serde(default)]
    pub disable_rpc_client: bool,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            broker_address: default_broker_address(),
            username: None,
            password: None,
            sys_name: String::new(),
            app_name: String::new(),
            app_id: None,
            rpc_timeout_secs: default_rpc_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            event_load_balancing: false,
            enable_config_store: false,
            disable_event_client: false,
            disable_rpc_client: false,
        }
    }
}

fn default_broker_address() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_rpc_timeout() -> u64 {
    3
}

fn default_reconnect_delay() -> u64 {
    5
}

impl SynapseConfig {
    /// Create a configuration with the three required fields set and
    /// defaults everywhere else.
    pub fn new(
        broker_address: impl Into<String>,
        sys_name: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            broker_address: broker_address.into(),
            sys_name: sys_name.into(),
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from the default path or the `SYNAPSE_CONFIG`
    /// env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("SYNAPSE_CONFIG").unwrap_or_else(|_| "config/synapse.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: SynapseConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            sys_name = %config.sys_name,
            app_name = %config.app_name,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// A missing identity is the only fatal condition in the whole
    /// subsystem: without `sys_name` and `app_name` no topic can be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sys_name.is_empty() || self.app_name.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }

        if self.broker_address.is_empty() {
            return Err(ConfigError::Validation(
                "broker_address must not be empty".to_string(),
            ));
        }

        if self.rpc_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "rpc_timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

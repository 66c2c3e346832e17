use crate::adapter::{signal, whatsapp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub bridges: BridgeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS origin for subscribers; any origin when unset.
    pub client_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// EnvFilter directive for fine-grained control; overrides `level`.
    pub filter: Option<String>,
    /// Verbose store logging (the DEBUG environment flag).
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_signal_url")]
    pub signal_api_url: String,
    #[serde(default = "default_whatsapp_url")]
    pub whatsapp_api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default = "default_reference_host")]
    pub host: String,
    #[serde(default = "default_reference_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_signal_url() -> String {
    signal::DEFAULT_BRIDGE_URL.to_string()
}

fn default_whatsapp_url() -> String {
    whatsapp::DEFAULT_BRIDGE_URL.to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_reference_host() -> String {
    "1.1.1.1".to_string()
}

fn default_reference_port() -> u16 {
    80
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_origin: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            debug: false,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            signal_api_url: default_signal_url(),
            whatsapp_api_url: default_whatsapp_url(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            host: default_reference_host(),
            port: default_reference_port(),
        }
    }
}

impl Config {
    /// Load from the optional `ackwatch.toml` plus the environment. Invalid
    /// configuration is fatal at startup.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut cfg: Self = config::Config::builder()
            .add_source(config::File::with_name("ackwatch").required(false))
            .add_source(config::Environment::with_prefix("ACKWATCH").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// The short-form environment variables win over file values.
    fn apply_env_overrides(&mut self) -> Result<(), config::ConfigError> {
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| config::ConfigError::Message(format!("invalid PORT '{port}'")))?;
        }
        if let Ok(url) = std::env::var("SIGNAL_API_URL") {
            self.bridges.signal_api_url = url;
        }
        if let Ok(url) = std::env::var("WHATSAPP_API_URL") {
            self.bridges.whatsapp_api_url = url;
        }
        if let Ok(origin) = std::env::var("CLIENT_ORIGIN") {
            self.server.client_origin = Some(origin);
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if env_truthy("DEBUG") {
            self.logging.debug = true;
        }
        Ok(())
    }
}

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

// common/src/config.rs
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use config::{Config as ConfigFile, File, Environment};

/// Central configuration for the session layer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST backend (login, refresh, identity, messages)
    pub api_base_url: String,
    /// Base URL of the push channel; `/ws/updates/<identity>` is appended
    pub channel_base_url: String,
    /// Durable mirror of the access/refresh credential pair
    pub credential_store_path: String,
    pub request_timeout_secs: u64,
    /// Ceiling on a single refresh round trip
    pub refresh_timeout_secs: u64,
    pub log_level: String,

    pub channel: ChannelConfig,
}

/// Reconnect policy for the realtime channel
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Ceiling on one websocket handshake
    pub handshake_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ChannelConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8585".to_string(),
            channel_base_url: "ws://localhost:8585/notifications".to_string(),
            credential_store_path: "./.portal/credentials.json".to_string(),
            request_timeout_secs: 30,
            refresh_timeout_secs: 15,
            log_level: "info".to_string(),

            channel: ChannelConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self, config::ConfigError> {
        // Get the run mode, defaulting to "development"
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        // Locate the config directory
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                // Check if we're in the project root or a subcrate
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        let config = ConfigFile::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // APP__API_BASE_URL, APP__CHANNEL__MAX_ATTEMPTS, ...
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load from files, falling back to plain environment variables
    pub fn from_env() -> Self {
        match Self::load() {
            Ok(config) => {
                tracing::info!("Configuration loaded from files and environment");
                config
            },
            Err(e) => {
                tracing::warn!("Failed to load configuration from files: {}", e);
                tracing::info!("Falling back to environment variables only");

                let defaults = Self::default();

                let api_base_url = env::var("API_BASE_URL")
                    .unwrap_or(defaults.api_base_url);

                let channel_base_url = env::var("CHANNEL_BASE_URL")
                    .unwrap_or(defaults.channel_base_url);

                let credential_store_path = env::var("CREDENTIAL_STORE_PATH")
                    .unwrap_or(defaults.credential_store_path);

                let request_timeout_secs = env_number("REQUEST_TIMEOUT_SECS")
                    .unwrap_or(defaults.request_timeout_secs);

                let refresh_timeout_secs = env_number("REFRESH_TIMEOUT_SECS")
                    .unwrap_or(defaults.refresh_timeout_secs);

                let log_level = env::var("LOG_LEVEL")
                    .unwrap_or(defaults.log_level);

                let channel = ChannelConfig {
                    base_delay_ms: env_number("CHANNEL_BASE_DELAY_MS")
                        .unwrap_or(defaults.channel.base_delay_ms),
                    max_delay_ms: env_number("CHANNEL_MAX_DELAY_MS")
                        .unwrap_or(defaults.channel.max_delay_ms),
                    max_attempts: env_number("CHANNEL_MAX_ATTEMPTS")
                        .unwrap_or(defaults.channel.max_attempts),
                    handshake_timeout_ms: env_number("CHANNEL_HANDSHAKE_TIMEOUT_MS")
                        .unwrap_or(defaults.channel.handshake_timeout_ms),
                };

                Self {
                    api_base_url,
                    channel_base_url,
                    credential_store_path,
                    request_timeout_secs,
                    refresh_timeout_secs,
                    log_level,
                    channel,
                }
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

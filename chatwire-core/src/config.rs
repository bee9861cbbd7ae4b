// ABOUTME: ChatConfig parsing from TOML with CHATWIRE_* environment overrides
// ABOUTME: Covers brand/channel ids, environment URLs, auth mode, network and reconnect tuning

use crate::auth::AuthMode;
use crate::paths;
use crate::reconnect::BackoffConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub brand_id: i64,
    pub channel_id: String,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_environment_name")]
    pub name: String,
    /// Base URL of the REST API
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    /// Base URL of the WebSocket endpoint
    #[serde(default = "default_socket_url")]
    pub socket_url: String,
}

fn default_environment_name() -> String {
    "default".to_string()
}

fn default_chat_url() -> String {
    "https://chat.example.com".to_string()
}

fn default_socket_url() -> String {
    "wss://socket.example.com".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: default_environment_name(),
            chat_url: default_chat_url(),
            socket_url: default_socket_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_refresh_lookahead_secs")]
    pub refresh_lookahead_secs: u64,
}

fn default_refresh_lookahead_secs() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            refresh_lookahead_secs: default_refresh_lookahead_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Transport backend name, resolved through the TransportRegistry
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Upper bound for any single network leg (socket open, auth reply, send)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pending outbound frames before senders wait
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_transport() -> String {
    "mock".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_outbound_capacity() -> usize {
    64
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            timeout_secs: default_timeout_secs(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_retries: default_max_retries(),
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_retries: self.max_retries,
        }
    }
}

impl ChatConfig {
    /// Minimal config for a brand/channel pair with every other value defaulted
    pub fn new(brand_id: i64, channel_id: impl Into<String>) -> Self {
        Self {
            brand_id,
            channel_id: channel_id.into(),
            environment: EnvironmentConfig::default(),
            auth: AuthConfig::default(),
            network: NetworkConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }

    pub fn refresh_lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.refresh_lookahead_secs as i64)
    }

    /// Find config file in standard locations
    /// Priority: CHATWIRE_CONFIG_PATH env var > ./config.toml > XDG config dir
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("CHATWIRE_CONFIG_PATH") {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %path.display(), "CHATWIRE_CONFIG_PATH does not exist");
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Some(local);
        }

        let xdg = paths::config_file();
        if xdg.exists() {
            return Some(xdg);
        }

        None
    }

    /// Load configuration from the first config file found, then apply env overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                let brand_id = std::env::var("CHATWIRE_BRAND_ID")
                    .context("CHATWIRE_BRAND_ID is required when no config file exists")?;
                let brand_id = brand_id.parse().with_context(|| {
                    format!("CHATWIRE_BRAND_ID must be a valid number, got: {}", brand_id)
                })?;
                let channel_id = std::env::var("CHATWIRE_CHANNEL_ID")
                    .context("CHATWIRE_CHANNEL_ID is required when no config file exists")?;
                Self::new(brand_id, channel_id)
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without env overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<ChatConfig>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Override values with environment variables if present
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("CHATWIRE_BRAND_ID") {
            self.brand_id = val.parse().with_context(|| {
                format!("CHATWIRE_BRAND_ID must be a valid number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("CHATWIRE_CHANNEL_ID") {
            self.channel_id = val;
        }
        if let Ok(val) = std::env::var("CHATWIRE_CHAT_URL") {
            self.environment.chat_url = val;
        }
        if let Ok(val) = std::env::var("CHATWIRE_SOCKET_URL") {
            self.environment.socket_url = val;
        }
        if let Ok(val) = std::env::var("CHATWIRE_AUTH_MODE") {
            self.auth.mode = val.parse()?;
        }
        if let Ok(val) = std::env::var("CHATWIRE_NETWORK_TIMEOUT_SECS") {
            self.network.timeout_secs = val.parse().with_context(|| {
                format!(
                    "CHATWIRE_NETWORK_TIMEOUT_SECS must be a valid number, got: {}",
                    val
                )
            })?;
        }
        if let Ok(val) = std::env::var("CHATWIRE_TRANSPORT") {
            self.network.transport = val;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_id.trim().is_empty() {
            anyhow::bail!("channel_id must not be empty");
        }
        if self.network.timeout_secs == 0 {
            anyhow::bail!("network.timeout_secs must be greater than zero");
        }
        if self.network.outbound_capacity == 0 {
            anyhow::bail!("network.outbound_capacity must be greater than zero");
        }
        if self.reconnect.max_retries == 0 {
            anyhow::bail!("reconnect.max_retries must be greater than zero");
        }
        if self.reconnect.multiplier == 0 {
            anyhow::bail!("reconnect.multiplier must be greater than zero");
        }
        Ok(())
    }
}

//! Configuration loading for the Strata sync client.
//!
//! Every setting except `json_logs` must be present in the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use strata_cache::CacheConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_endpoint: String,
    pub auth: AuthConfig,
    pub request_timeout_ms: u64,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub draft_undo_limit: usize,
    pub reconnect: ReconnectConfig,
    pub heartbeat_interval_ms: u64,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub max_size_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub interval_ms: u64,
    pub page_size: usize,
    pub delta: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or STRATA_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<ConfigError> for strata_core::StrataError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidValue { field, reason } => strata_core::ConfigError::InvalidValue {
                field: field.to_string(),
                value: String::new(),
                reason,
            }
            .into(),
            other => strata_core::ConfigError::InvalidValue {
                field: "config".to_string(),
                value: String::new(),
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(invalid("api_base_url", "must not be empty"));
        }
        if self.ws_endpoint.trim().is_empty() {
            return Err(invalid("ws_endpoint", "must not be empty"));
        }
        if !self.ws_endpoint.starts_with("ws://") && !self.ws_endpoint.starts_with("wss://") {
            return Err(invalid("ws_endpoint", "must start with ws:// or wss://"));
        }
        if self.auth.api_key.is_none() && self.auth.jwt.is_none() {
            return Err(invalid("auth", "api_key or jwt must be provided"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be > 0"));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(invalid("store.path", "must not be empty"));
        }
        if self.store.max_size_mb == 0 {
            return Err(invalid("store.max_size_mb", "must be > 0"));
        }
        if self.sync.interval_ms == 0 {
            return Err(invalid("sync.interval_ms", "must be > 0"));
        }
        if self.sync.page_size == 0 {
            return Err(invalid("sync.page_size", "must be > 0"));
        }
        if self.draft_undo_limit == 0 {
            return Err(invalid("draft_undo_limit", "must be > 0"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms", "must be > 0"));
        }
        if self.reconnect.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", "must be > 0"));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid("reconnect.max_ms", "must be >= initial_ms"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be >= 1.0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "must be > 0"));
        }
        Ok(())
    }

    /// Cache settings derived from this config.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_delta_sync(self.sync.delta)
            .with_page_size(self.sync.page_size)
            .with_draft_undo_limit(self.draft_undo_limit)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("STRATA_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

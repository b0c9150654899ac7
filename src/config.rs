//! Configuration management.
//!
//! Settings come from a TOML file overlaid with `FEEN_*` environment
//! variables. Secrets (master key, session secret) are expected from the
//! environment in production; file values exist for development.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Vault and secret settings
    #[serde(default)]
    pub vault: VaultConfig,

    /// Store backend settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Quota defaults and queue sizing
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Log retention settings
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GatewayError::Config(format!("failed to read config file: {e}")))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `FEEN_*` environment overrides on top of this config.
    pub fn apply_env(mut self) -> Self {
        if let Ok(host) = std::env::var("FEEN_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("FEEN_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(base_url) = std::env::var("FEEN_BASE_URL") {
            self.server.base_url = base_url;
        }
        if let Ok(master_key) = std::env::var("FEEN_MASTER_KEY") {
            self.vault.master_key = master_key;
        }
        if let Ok(secret) = std::env::var("FEEN_SESSION_SECRET") {
            self.vault.session_secret = secret;
        }
        if let Ok(url) = std::env::var("FEEN_PERSISTENT_URL") {
            self.store.persistent_url = url;
        }
        if let Ok(url) = std::env::var("FEEN_FAST_URL") {
            self.store.fast_url = url;
        }
        self
    }

    /// Boot-time validation; a process must not come up half-configured.
    pub fn validate(&self) -> Result<()> {
        if self.vault.master_key.is_empty() {
            return Err(GatewayError::Config(
                "master encryption key is required (FEEN_MASTER_KEY)".into(),
            ));
        }
        if self.vault.session_secret.is_empty() {
            return Err(GatewayError::Config(
                "session secret is required (FEEN_SESSION_SECRET)".into(),
            ));
        }
        if self.limits.default_rate_per_minute == 0 {
            return Err(GatewayError::Config(
                "default_rate_per_minute must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Public base URL the gateway identifies itself with
    pub base_url: String,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            base_url: "http://127.0.0.1:8080".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Vault and secret configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Master encryption key: 32 bytes used as-is, anything else derived.
    #[serde(default)]
    pub master_key: String,

    /// HMAC secret for admin session bearers.
    #[serde(default)]
    pub session_secret: String,

    /// Keep the plaintext access token on the row so owners can re-view it.
    /// Off by default: hash-only at rest, token shown exactly once.
    #[serde(default)]
    pub store_plaintext_tokens: bool,
}

/// Store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Persistent store: `memory://` or `postgres://...`
    pub persistent_url: String,

    /// Fast store: `memory://` or `redis://...`
    pub fast_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persistent_url: "memory://".to_string(),
            fast_url: "memory://".to_string(),
        }
    }
}

/// Quota defaults and usage queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Rate applied to new tokens when the creator does not set one.
    pub default_rate_per_minute: u32,

    /// Daily cap applied to new tokens; 0 means uncapped.
    pub default_daily_cap: u32,

    /// Bounded usage queue capacity.
    pub usage_queue_capacity: usize,

    /// Usage flush worker count.
    pub usage_workers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_rate_per_minute: 60,
            default_daily_cap: 0,
            usage_queue_capacity: 4096,
            usage_workers: 2,
        }
    }
}

/// Retention windows for the append-only logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days of usage records to keep.
    pub usage_days: u32,

    /// Days of audit records to keep.
    pub audit_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            usage_days: 90,
            audit_days: 90,
        }
    }
}

//! Configuration management for crafthost-orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/crafthost/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_host: String,

    /// Listen port.
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|_| ConfigError::ValidationError("Invalid listen address".to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/crafthost/orchestrator.db"),
        }
    }
}

/// Pterodactyl panel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Panel base URL (e.g. https://panel.example.com).
    pub base_url: String,

    /// Application API key (admin scope).
    pub application_api_key: String,

    /// Client API key, used for power signals and resource usage.
    pub client_api_key: Option<String>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// CurseForge API key forwarded to modpack server environments.
    pub curse_api_key: Option<String>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            application_api_key: String::new(),
            client_api_key: None,
            timeout_secs: 15,
            curse_api_key: None,
        }
    }
}

impl PanelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "panel.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for JWT signing.
    pub jwt_secret: String,

    /// Access token lifetime in minutes.
    pub access_ttl_minutes: i64,

    /// Refresh token lifetime in minutes.
    pub refresh_ttl_minutes: i64,

    /// Whether self-registration is allowed. The orchestrator keeps this off.
    pub registration_enabled: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            // 7 days / 30 days
            access_ttl_minutes: 60 * 24 * 7,
            refresh_ttl_minutes: 60 * 24 * 30,
            registration_enabled: false,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_ttl_minutes < 1 {
            return Err(ConfigError::ValidationError(
                "auth.access_ttl_minutes must be at least 1".to_string(),
            ));
        }
        if self.refresh_ttl_minutes < self.access_ttl_minutes {
            return Err(ConfigError::ValidationError(
                "auth.refresh_ttl_minutes must not be shorter than the access TTL".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capacity snapshot configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Refresh interval in seconds.
    pub refresh_interval_secs: u64,

    /// Where the JSON snapshot is persisted.
    pub snapshot_path: PathBuf,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            snapshot_path: PathBuf::from("/var/lib/crafthost/capacity.json"),
        }
    }
}

impl CapacityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_secs < 30 {
            return Err(ConfigError::ValidationError(
                "capacity.refresh_interval_secs must be at least 30".to_string(),
            ));
        }
        if self.refresh_interval_secs > 3600 {
            return Err(ConfigError::ValidationError(
                "capacity.refresh_interval_secs must be at most 3600".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stripe webhook configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StripeConfig {
    /// Webhook signing secret (whsec_...).
    pub webhook_secret: String,

    /// Allowed clock skew for signed webhooks, in seconds.
    pub tolerance_secs: Option<i64>,
}

impl StripeConfig {
    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs.unwrap_or(300)
    }
}

/// Slack alerting configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Incoming webhook URL. Alerting is disabled when unset.
    pub webhook_url: Option<String>,
}

/// Plan catalog configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlansConfig {
    /// Path to the plan catalog TOML file.
    pub path: PathBuf,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/crafthost/plans.toml"),
        }
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub panel: PanelConfig,
    pub auth: AuthConfig,
    pub capacity: CapacityConfig,
    pub stripe: StripeConfig,
    pub slack: SlackConfig,
    pub plans: PlansConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.panel.validate()?;
        self.auth.validate()?;
        self.capacity.validate()?;
        Ok(())
    }
}

/// Load configuration from the default or specified path.
pub fn load_config(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or(std::path::Path::new(DEFAULT_CONFIG_PATH));
    Config::from_file(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.listen_port, 8080);
        assert!(!config.auth.registration_enabled);
        assert_eq!(config.capacity.refresh_interval_secs, 300);
        assert_eq!(config.stripe.tolerance_secs(), 300);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[api]
listen_host = "0.0.0.0"
listen_port = 9090

[panel]
base_url = "https://panel.example.com"
application_api_key = "ptla_test"
timeout_secs = 10

[auth]
jwt_secret = "super-secret"
access_ttl_minutes = 60

[capacity]
refresh_interval_secs = 120

[stripe]
webhook_secret = "whsec_test"
tolerance_secs = 600
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api.listen_port, 9090);
        assert_eq!(config.panel.timeout_secs, 10);
        assert_eq!(config.auth.access_ttl_minutes, 60);
        assert_eq!(config.capacity.refresh_interval_secs, 120);
        assert_eq!(config.stripe.tolerance_secs(), 600);
    }

    #[test]
    fn test_refresh_interval_bounds() {
        let mut config = Config::default();
        config.capacity.refresh_interval_secs = 5;
        assert!(config.validate().is_err());

        config.capacity.refresh_interval_secs = 7200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refresh_ttl_must_cover_access_ttl() {
        let mut config = Config::default();
        config.auth.access_ttl_minutes = 120;
        config.auth.refresh_ttl_minutes = 60;
        assert!(config.validate().is_err());
    }
}

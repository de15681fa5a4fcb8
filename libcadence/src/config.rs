//! Configuration management for Cadence
//!
//! Configuration lives in a TOML file (see [`resolve_config_path`]). Every
//! section is optional; anything left out falls back to the defaults below.
//! Durations are plain integer seconds.
//!
//! ```toml
//! [database]
//! path = "~/.local/share/cadence/cadence.db"
//!
//! [scheduler]
//! poll_interval = 30
//! max_concurrency = 8
//!
//! [scheduler.backoff]
//! base = 120
//! cap = 3600
//!
//! [networks.x]
//! enabled = true
//! api_base = "https://gateway.example.com/x"
//! client_id = "abc"
//! client_secret_env = "CADENCE_X_CLIENT_SECRET"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::types::Network;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub refresher: RefresherConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Per-network gateway settings, keyed by network name
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/cadence/cadence.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between sweeps
    pub poll_interval: u64,
    /// Maximum due posts picked up per sweep
    pub batch_size: i64,
    /// Posts published concurrently within one sweep
    pub max_concurrency: usize,
    /// Per-attempt publish timeout in seconds
    pub publish_timeout: u64,
    /// Seconds after which a `publishing` lease is considered abandoned;
    /// must exceed twice `publish_timeout`
    pub stale_lease: u64,
    pub max_retries: i64,
    /// Lower retry ceiling for errors the network did not explain
    pub max_unknown_retries: i64,
    pub backoff: BackoffConfig,
    /// Posts per hour, keyed by network name
    pub rate_limits: HashMap<String, u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 30,
            batch_size: 100,
            max_concurrency: 8,
            publish_timeout: 30,
            stale_lease: 600,
            max_retries: 5,
            max_unknown_retries: 3,
            backoff: BackoffConfig::default(),
            rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay in seconds
    pub base: u64,
    pub factor: u32,
    /// Longest delay in seconds
    pub cap: u64,
    /// Fraction of the delay randomly added or removed (0.1 = +/-10%)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: 120,
            factor: 2,
            cap: 3600,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefresherConfig {
    /// Seconds between refresh runs
    pub interval: u64,
    /// Refresh tokens expiring within this many seconds
    pub lookahead: u64,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval: 3600,
            lookahead: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub interval: u64,
    /// Collect metrics for posts published within this many seconds
    pub window: u64,
    pub batch_size: i64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 6 * 3600,
            window: 7 * 24 * 3600,
            batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory the local object store writes into
    pub storage_root: String,
    /// URL prefix under which `storage_root` is served
    pub public_base_url: String,
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            storage_root: "~/.local/share/cadence/media".to_string(),
            public_base_url: "http://localhost:8080/media".to_string(),
            max_image_bytes: 8 * 1024 * 1024,
            max_video_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Seconds a `beginAuth` state stays valid
    pub state_ttl: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self { state_ttl: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the publishing gateway for this network
    pub api_base: String,
    /// Authorization page users are redirected to; defaults to `{api_base}/oauth/authorize`
    #[serde(default)]
    pub authorize_url: Option<String>,
    pub client_id: String,
    /// Name of the environment variable holding the client secret
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Whether the gateway can find a post by idempotency key
    #[serde(default)]
    pub supports_lookup: bool,
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

impl NetworkConfig {
    /// Read the client secret from the configured environment variable
    pub fn client_secret(&self) -> Option<String> {
        self.client_secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error; defaults are used instead. The
    /// `CADENCE_DB_PATH` environment variable overrides `database.path`.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        if let Ok(db_path) = std::env::var("CADENCE_DB_PATH") {
            config.database.path = db_path;
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.scheduler.max_concurrency == 0 {
            return Err(invalid("scheduler.max_concurrency", "must be at least 1").into());
        }
        if self.scheduler.publish_timeout == 0 {
            return Err(invalid("scheduler.publish_timeout", "must be at least 1 second").into());
        }
        // One claim may spend a publish timeout on the network call and
        // another on the inline token refresh before it settles
        if self.scheduler.stale_lease <= self.scheduler.publish_timeout.saturating_mul(2) {
            return Err(invalid(
                "scheduler.stale_lease",
                "must exceed twice scheduler.publish_timeout",
            )
            .into());
        }
        if self.scheduler.max_retries < 0 || self.scheduler.max_unknown_retries < 0 {
            return Err(invalid("scheduler.max_retries", "must not be negative").into());
        }
        let backoff = &self.scheduler.backoff;
        if backoff.factor < 1 {
            return Err(invalid("scheduler.backoff.factor", "must be at least 1").into());
        }
        if backoff.cap < backoff.base {
            return Err(invalid("scheduler.backoff.cap", "must not be below base").into());
        }
        if !(0.0..1.0).contains(&backoff.jitter) {
            return Err(invalid("scheduler.backoff.jitter", "must be in [0, 1)").into());
        }
        for name in self.networks.keys().chain(self.scheduler.rate_limits.keys()) {
            name.parse::<Network>()
                .map_err(|e| invalid(&format!("networks.{}", name), &e))?;
        }
        Ok(())
    }

    /// Enabled network sections, parsed
    pub fn enabled_networks(&self) -> Vec<(Network, &NetworkConfig)> {
        self.networks
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .filter_map(|(name, cfg)| name.parse::<Network>().ok().map(|n| (n, cfg)))
            .collect()
    }

    /// Per-network rate limits with parsed keys
    pub fn rate_limits(&self) -> HashMap<Network, u32> {
        self.scheduler
            .rate_limits
            .iter()
            .filter_map(|(name, limit)| name.parse::<Network>().ok().map(|n| (n, *limit)))
            .collect()
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("cadence").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("cadence"))
}

//! Configuration management for plugind.
//!
//! Handles loading configuration from TOML files and applying `PLUGIND_*`
//! environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::{PluginError, PluginResult};

/// Daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node and storage settings
    pub daemon: DaemonConfig,

    /// Asset cache settings
    pub media: MediaConfig,

    /// Coordination store settings
    pub coordination: CoordinationConfig,

    /// Host invocation API used to reach plugins on other nodes
    pub inner_api: InnerApiConfig,

    /// Serverless execution platform
    pub serverless: ServerlessConfig,

    /// Watcher timings
    pub watcher: WatcherConfig,
}

/// Execution platform a node provisions plugins on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Worker processes on this node
    #[default]
    Local,
    /// Functions on an external platform
    Serverless,
}

impl std::str::FromStr for Platform {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "serverless" => Ok(Self::Serverless),
            other => Err(PluginError::Config(format!("unknown platform '{other}'"))),
        }
    }
}

/// Node and storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node identifier; a random one is generated when empty
    pub node_id: String,

    /// Address other nodes use to reach this one
    pub advertise_address: String,

    /// Where plugins are provisioned
    pub platform: Platform,

    /// Largest accepted package, in bytes
    pub max_package_size: u64,

    /// Directory plugins are unpacked into
    pub working_path: PathBuf,

    /// Directory watched for package files
    pub storage_path: PathBuf,
}

/// Asset cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory backing the cache
    pub cache_path: PathBuf,

    /// In-memory cache capacity, in bytes
    pub cache_size: u64,
}

/// Coordination store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Store address (`memory://` for a process-local store)
    pub address: String,

    /// Store password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Install lock lease, in seconds
    pub lock_ttl_secs: u64,

    /// How long an install waits for a held lock, in seconds
    pub lock_wait_secs: u64,

    /// Re-announce interval, in seconds
    pub heartbeat_interval_secs: u64,

    /// Age after which a mapping entry is no longer trusted, in seconds
    pub stale_after_secs: u64,
}

/// Host invocation API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InnerApiConfig {
    pub url: String,
    pub key: String,
}

/// Serverless execution platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerlessConfig {
    /// Platform endpoint
    pub url: String,

    /// Platform API key
    pub key: String,

    /// Deployment deadline, in seconds
    pub deploy_timeout_secs: u64,
}

/// Watcher timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Periodic rescan of the storage directory, in seconds
    pub scan_interval_secs: u64,

    /// First reconnect delay, in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap, in seconds
    pub reconnect_max_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            advertise_address: "http://127.0.0.1:5002".to_string(),
            platform: Platform::Local,
            max_package_size: 52_428_800,
            working_path: PathBuf::from("./storage/cwd"),
            storage_path: PathBuf::from("./storage/plugins"),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self { cache_path: PathBuf::from("./storage/assets"), cache_size: 67_108_864 }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            address: "memory://".to_string(),
            password: None,
            lock_ttl_secs: 30,
            lock_wait_secs: 10,
            heartbeat_interval_secs: 10,
            stale_after_secs: 30,
        }
    }
}

impl Default for InnerApiConfig {
    fn default() -> Self {
        Self { url: "http://127.0.0.1:5001".to_string(), key: String::new() }
    }
}

impl Default for ServerlessConfig {
    fn default() -> Self {
        Self { url: String::new(), key: String::new(), deploy_timeout_secs: 300 }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { scan_interval_secs: 30, reconnect_initial_ms: 500, reconnect_max_secs: 30 }
    }
}

impl CoordinationConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl ServerlessConfig {
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }
}

impl WatcherConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `plugind.toml` in current directory
    /// 2. `~/.config/plugind/config.toml`
    /// 3. Falls back to defaults
    ///
    /// Environment overrides are applied in every case.
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from("plugind.toml");
        let mut config = if local_config.exists() {
            Self::read_file(&local_config)?
        } else {
            match Self::config_dir().map(|dir| dir.join("config.toml")) {
                Some(global_config) if global_config.exists() => Self::read_file(&global_config)?,
                _ => Self::default(),
            }
        };

        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a specific file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `PLUGIND_*` environment variable overrides.
    pub fn apply_env(&mut self) -> PluginResult<()> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(platform) = var("PLUGIND_PLATFORM") {
            self.daemon.platform = platform.parse()?;
        }
        if let Some(node_id) = var("PLUGIND_NODE_ID") {
            self.daemon.node_id = node_id;
        }
        if let Some(address) = var("PLUGIND_STORE_ADDRESS") {
            self.coordination.address = address;
        }
        if let Some(password) = var("PLUGIND_STORE_PASSWORD") {
            self.coordination.password = Some(password);
        }
        if let Some(url) = var("PLUGIND_INNER_API_URL") {
            self.inner_api.url = url;
        }
        if let Some(key) = var("PLUGIND_INNER_API_KEY") {
            self.inner_api.key = key;
        }
        if let Some(size) = var("PLUGIND_MAX_PACKAGE_SIZE") {
            self.daemon.max_package_size = size.parse().map_err(|_| {
                PluginError::Config(format!("PLUGIND_MAX_PACKAGE_SIZE is not a number: {size}"))
            })?;
        }

        Ok(())
    }

    /// Check the configuration for values the daemon cannot run with.
    pub fn validate(&self) -> PluginResult<()> {
        if self.daemon.max_package_size == 0 {
            return Err(PluginError::Config("daemon.max_package_size must be positive".into()));
        }
        if self.media.cache_size == 0 {
            return Err(PluginError::Config("media.cache_size must be positive".into()));
        }
        if self.daemon.platform == Platform::Serverless && self.serverless.url.is_empty() {
            return Err(PluginError::Config(
                "serverless.url is required when daemon.platform is serverless".into(),
            ));
        }
        // Leases are refreshed every ttl/3.
        if self.coordination.lock_ttl_secs < 3 {
            return Err(PluginError::Config(
                "coordination.lock_ttl_secs must be at least 3".into(),
            ));
        }
        if self.coordination.stale_after_secs < self.coordination.heartbeat_interval_secs {
            return Err(PluginError::Config(
                "coordination.stale_after_secs must not be shorter than heartbeat_interval_secs"
                    .into(),
            ));
        }
        if self.coordination.heartbeat_interval_secs == 0 || self.watcher.scan_interval_secs == 0 {
            return Err(PluginError::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("plugind"))
    }
}

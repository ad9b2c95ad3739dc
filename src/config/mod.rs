//! Configuration management for healthmesh
//!
//! Settings are resolved in order: built-in defaults, an optional TOML file,
//! then `HEALTHMESH_*` environment overrides. The result is validated before
//! anything is started.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::alarm::maintenance::DEFAULT_MAINTENANCE_ROOT;
use crate::alarm::SinkConfig;
use crate::classifier::ClassifierConfig;
use crate::collector::{ClientConfig, CollectorConfig};
use crate::coordination::watcher::DEFAULT_LEAF_PATTERN;
use crate::coordination::RedisCoordinationConfig;
use crate::models::{SlaveInfo, Zone};
use crate::platform::PlatformConfig;
use crate::policy::PolicyConfig;
use crate::pool::JobPoolConfig;
use crate::store::{JobStoreConfig, RedisStoreConfig};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "HEALTHMESH_";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Configuration problems never fix themselves
    pub fn is_recoverable(&self) -> bool {
        false
    }

    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub slave: SlaveConfig,
    pub logging: LoggingConfig,
}

/// Where job reports are persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DurableBackend {
    /// In-process store; reports do not survive a restart
    #[default]
    Memory,
    Redis(RedisStoreConfig),
}

/// Where the registration tree lives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// In-process tree, fed only through the registry API
    #[default]
    Memory,
    /// Tree shared with the registering services and other masters
    Redis(RedisCoordinationConfig),
}

/// Tree watcher settings as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub retry_delay_secs: u64,
    /// Children matching this pattern are leaves, the rest branches
    pub leaf_pattern: String,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            retry_delay_secs: 2,
            leaf_pattern: DEFAULT_LEAF_PATTERN.to_string(),
        }
    }
}

impl WatcherSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs.max(1))
    }
}

/// Master tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// HTTP bind address
    pub bind_address: String,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Whether this process starts as the active master
    pub is_master: bool,

    /// Sub-tree fed to the flap classifier
    pub classifier_root: String,

    /// Sub-tree fed to the job pool
    pub pool_root: String,

    pub maintenance_root: String,

    pub watcher: WatcherSettings,
    pub classifier: ClassifierConfig,
    pub pool: JobPoolConfig,
    pub job_store: JobStoreConfig,
    pub policy: PolicyConfig,
    pub platform: PlatformConfig,

    /// Alarm destinations; empty logs alarms only
    pub sinks: Vec<SinkConfig>,

    pub coordination: CoordinationBackend,
    pub durable: DurableBackend,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            enable_cors: false,
            enable_request_logging: true,
            is_master: true,
            classifier_root: "/".to_string(),
            pool_root: "/lb".to_string(),
            maintenance_root: DEFAULT_MAINTENANCE_ROOT.to_string(),
            watcher: WatcherSettings::default(),
            classifier: ClassifierConfig::default(),
            pool: JobPoolConfig::default(),
            job_store: JobStoreConfig::default(),
            policy: PolicyConfig::default(),
            platform: PlatformConfig::default(),
            sinks: Vec::new(),
            coordination: CoordinationBackend::Memory,
            durable: DurableBackend::Memory,
        }
    }
}

fn require_absolute(field: &str, path: &str) -> Result<(), ConfigError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("path must be absolute: {path}")))
    }
}

fn require_redis_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("not a redis URL: {url}")))
    }
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(field, "must be greater than 0"))
    } else {
        Ok(())
    }
}

impl MasterConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid("master.bind_address", e.to_string()))?;

        require_absolute("master.classifier_root", &self.classifier_root)?;
        require_absolute("master.pool_root", &self.pool_root)?;
        require_absolute("master.maintenance_root", &self.maintenance_root)?;

        regex::Regex::new(&self.watcher.leaf_pattern)
            .map_err(|e| ConfigError::invalid("master.watcher.leaf_pattern", e.to_string()))?;

        require_positive("master.classifier.sweep_interval_secs", self.classifier.sweep_interval_secs)?;
        if self.classifier.max_flap_entries == 0 {
            return Err(ConfigError::invalid("master.classifier.max_flap_entries", "must be greater than 0"));
        }

        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::invalid("master.pool.queue_capacity", "must be greater than 0"));
        }
        if self.pool.subscriber_buffer == 0 {
            return Err(ConfigError::invalid("master.pool.subscriber_buffer", "must be greater than 0"));
        }

        require_positive("master.job_store.job_ttl_secs", self.job_store.job_ttl_secs)?;
        if self.job_store.cache_expiry_secs < self.job_store.job_ttl_secs {
            return Err(ConfigError::invalid(
                "master.job_store.cache_expiry_secs",
                "must not be shorter than job_ttl_secs",
            ));
        }

        require_positive("master.policy.interval_secs", self.policy.interval_secs)?;

        if let CoordinationBackend::Redis(redis) = &self.coordination {
            require_redis_url("master.coordination.url", &redis.url)?;
            if redis.pool_size == 0 {
                return Err(ConfigError::invalid("master.coordination.pool_size", "must be greater than 0"));
            }
            if redis.key_prefix.is_empty() {
                return Err(ConfigError::invalid("master.coordination.key_prefix", "must not be empty"));
            }
        }

        if let DurableBackend::Redis(redis) = &self.durable {
            require_redis_url("master.durable.url", &redis.url)?;
            if redis.pool_size == 0 {
                return Err(ConfigError::invalid("master.durable.pool_size", "must be greater than 0"));
            }
        }

        Ok(())
    }
}

/// Slave tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// Master server URL
    pub master_url: String,

    /// Name this slave reports under
    pub cluster_name: String,

    /// Zones this slave probes; `*` covers every zone
    pub zones: Vec<Zone>,

    /// Address advertised in reports
    pub local_ip: String,

    pub request_timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: u64,

    pub collector: CollectorConfig,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            master_url: "http://127.0.0.1:8080".to_string(),
            cluster_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "slave".to_string()),
            zones: vec![Zone::new("default")],
            local_ip: "127.0.0.1".to_string(),
            request_timeout_secs: 10,
            retry_count: 3,
            retry_delay_secs: 1,
            collector: CollectorConfig::default(),
        }
    }
}

impl SlaveConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.master_url)
            .map_err(|e| ConfigError::invalid("slave.master_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "slave.master_url",
                format!("unsupported scheme: {}", url.scheme()),
            ));
        }

        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::invalid("slave.cluster_name", "must not be empty"));
        }
        if self.zones.is_empty() {
            return Err(ConfigError::invalid("slave.zones", "at least one zone is required"));
        }

        require_positive("slave.collector.probe_timeout_secs", self.collector.probe_timeout_secs)?;
        require_positive("slave.collector.check_interval_secs", self.collector.check_interval_secs)?;
        require_positive("slave.collector.resync_secs", self.collector.resync_secs)?;
        Ok(())
    }

    /// Identity presented to the master
    pub fn slave_info(&self) -> SlaveInfo {
        SlaveInfo {
            server_info: crate::models::ServerInfo::local(&self.local_ip),
            ..SlaveInfo::new(&self.cluster_name, self.zones.clone())
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.master_url)
            .with_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_retry(self.retry_count, Duration::from_secs(self.retry_delay_secs))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::invalid("logging.level", format!("unknown level: {}", self.level)));
        }
        if !matches!(self.format.as_str(), "text" | "json") {
            return Err(ConfigError::invalid("logging.format", format!("unknown format: {}", self.format)));
        }
        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        Some(value) => value.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidEnv {
            var: format!("{ENV_PREFIX}{name}"),
            value,
        }),
        None => Ok(None),
    }
}

impl Config {
    /// Defaults, then `path` if given, then environment overrides, validated
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `HEALTHMESH_*` overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(address) = env_var("BIND_ADDRESS") {
            self.master.bind_address = address;
        }
        if let Some(is_master) = env_parse::<bool>("IS_MASTER")? {
            self.master.is_master = is_master;
        }
        if let Some(root) = env_var("POOL_ROOT") {
            self.master.pool_root = root;
        }
        if let Some(url) = env_var("REDIS_URL") {
            match &mut self.master.durable {
                DurableBackend::Redis(redis) => redis.url = url,
                DurableBackend::Memory => {
                    self.master.durable = DurableBackend::Redis(RedisStoreConfig {
                        url,
                        ..RedisStoreConfig::default()
                    });
                }
            }
        }
        if let Some(url) = env_var("COORDINATION_URL") {
            match &mut self.master.coordination {
                CoordinationBackend::Redis(redis) => redis.url = url,
                CoordinationBackend::Memory => {
                    self.master.coordination = CoordinationBackend::Redis(RedisCoordinationConfig {
                        url,
                        ..RedisCoordinationConfig::default()
                    });
                }
            }
        }
        if let Some(secs) = env_parse::<u64>("FLAP_WINDOW_SECS")? {
            self.master.classifier.flap_window_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("CONVERGENCE_WINDOW_SECS")? {
            self.master.policy.convergence_window_secs = secs;
        }

        if let Some(url) = env_var("MASTER_URL") {
            self.slave.master_url = url;
        }
        if let Some(name) = env_var("CLUSTER_NAME") {
            self.slave.cluster_name = name;
        }
        if let Some(zones) = env_var("ZONES") {
            self.slave.zones = zones
                .split(',')
                .map(str::trim)
                .filter(|zone| !zone.is_empty())
                .map(Zone::new)
                .collect();
        }
        if let Some(ip) = env_var("LOCAL_IP") {
            self.slave.local_ip = ip;
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_var("LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.master.validate()?;
        self.slave.validate()?;
        self.logging.validate()
    }
}

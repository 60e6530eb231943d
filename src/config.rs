use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cache::CacheSettings;
use crate::registry::{Role, SelectorPolicy, TopologySettings};
use crate::roles::ALL_ROLES;

/// Top-level configuration for the streamfold collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Dispatch and persistence configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Service call listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Identity cache sizing, shared by every identity cache.
    #[serde(default)]
    pub identity_cache: IdentityCacheConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Synthetic agent traffic for standalone runs.
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

/// Dispatch and persistence configuration.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    /// Maximum time a delta waits in a shard buffer. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Per-role topology overrides keyed by role name.
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
}

/// Topology of one role.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    /// Slots per shard queue; must be a power of two. Default: 4096.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of shard workers. Default: 2.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Merge buffered rows with the stored row before writing. Defaults to
    /// true for roles with add or cover columns.
    #[serde(default)]
    pub need_merge_with_storage: Option<bool>,

    /// Shard selection policy override (round_robin, consistent_hash).
    #[serde(default)]
    pub selector: Option<SelectorPolicy>,
}

/// Service call listener configuration.
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    /// Apdex threshold T. Default: 500ms.
    #[serde(default = "default_apdex_threshold", with = "humantime_serde")]
    pub apdex_threshold: Duration,
}

/// Identity cache sizing.
#[derive(Debug, Deserialize)]
pub struct IdentityCacheConfig {
    /// Maximum cached identities per cache. Default: 100000.
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,

    /// Expiry after insert. Default: never.
    #[serde(default, with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Synthetic traffic generator configuration.
#[derive(Debug, Deserialize)]
pub struct SyntheticConfig {
    /// Enable the generator. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Number of simulated agents. Default: 4.
    #[serde(default = "default_synthetic_agents")]
    pub agents: usize,

    /// Pause between generated calls per agent. Default: 100ms.
    #[serde(default = "default_synthetic_interval", with = "humantime_serde")]
    pub interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_shards() -> usize {
    2
}

fn default_apdex_threshold() -> Duration {
    Duration::from_millis(500)
}

fn default_cache_capacity() -> u64 {
    100_000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_synthetic_agents() -> usize {
    4
}

fn default_synthetic_interval() -> Duration {
    Duration::from_millis(100)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pipeline: PipelineConfig::default(),
            listener: ListenerConfig::default(),
            identity_cache: IdentityCacheConfig::default(),
            health: HealthConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            roles: HashMap::new(),
        }
    }
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            shards: default_shards(),
            need_merge_with_storage: None,
            selector: None,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            apdex_threshold: default_apdex_threshold(),
        }
    }
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
            time_to_live: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agents: default_synthetic_agents(),
            interval: default_synthetic_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.flush_interval.is_zero() {
            bail!("pipeline.flush_interval must be positive");
        }

        for (name, role) in &self.pipeline.roles {
            if !ALL_ROLES.contains(&name.as_str()) {
                bail!("unknown role in pipeline.roles: {name}");
            }
            if role.shards == 0 {
                bail!("pipeline.roles.{name}.shards must be positive");
            }
            if !role.queue_capacity.is_power_of_two() {
                bail!(
                    "pipeline.roles.{name}.queue_capacity must be a power of two, got {}",
                    role.queue_capacity
                );
            }
        }

        if self.listener.apdex_threshold.is_zero() {
            bail!("listener.apdex_threshold must be positive");
        }

        if self.identity_cache.max_capacity == 0 {
            bail!("identity_cache.max_capacity must be positive");
        }

        if self.synthetic.enabled {
            if self.synthetic.agents == 0 {
                bail!("synthetic.agents must be positive when enabled");
            }
            if self.synthetic.interval.is_zero() {
                bail!("synthetic.interval must be positive when enabled");
            }
        }

        Ok(())
    }

    /// Topology settings for `role`, falling back to defaults.
    pub fn role_settings(&self, role: &Role) -> TopologySettings {
        let cfg = self
            .pipeline
            .roles
            .get(role.as_str())
            .cloned()
            .unwrap_or_default();

        TopologySettings {
            shards: cfg.shards,
            queue_capacity: cfg.queue_capacity,
            need_merge_with_storage: cfg.need_merge_with_storage,
            selector: cfg.selector,
        }
    }
}

impl IdentityCacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            max_capacity: self.max_capacity,
            time_to_live: self.time_to_live,
        }
    }
}

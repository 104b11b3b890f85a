//! Target configuration parsing and defaults.
//!
//! A [`TargetConfig`] is what callers hand to the registry: every field is
//! optional, mirroring the TOML shape. [`TargetConfig::resolve`] fills the
//! gaps with the documented defaults and validates pool sizing.
//!
//! ```toml
//! host = "cache.internal"
//! port = 6379
//! db = 2
//!
//! [options]
//! connect_timeout_ms = 500
//!
//! [pool]
//! max = 4
//! min = 1
//! idle_timeout_ms = 30000
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::identity::TargetIdentity;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_NAMESPACE: u32 = 0;

/// Largest accepted `pool.max`.
pub const MAX_POOL_SIZE: usize = 65_536;

/// Client option key defaulted to `true` when absent.
pub const DETECT_BUFFERS: &str = "detect_buffers";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Logical database index selected on every new connection.
    #[serde(alias = "db")]
    pub namespace: Option<u32>,
    /// Opaque client options passed through to the connection factory.
    pub options: Option<HashMap<String, toml::Value>>,
    pub pool: Option<PoolOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum concurrent connections (default: 1).
    pub max: Option<usize>,
    /// Minimum connections kept ready (default: 0).
    pub min: Option<usize>,
    /// Idle time after which a connection is reaped (default: 30000).
    pub idle_timeout_ms: Option<u64>,
    /// How often the reaper runs (default: 1000).
    pub reap_interval_ms: Option<u64>,
    /// Upper bound on waiting for a free slot (default: wait forever).
    pub acquire_timeout_ms: Option<u64>,
    /// How long shutdown waits for checked-out connections (default: 30000).
    pub drain_timeout_ms: Option<u64>,
}

/// Pool sizing and timing with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max: usize,
    pub min: usize,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub acquire_timeout: Option<Duration>,
    pub drain_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max: 1,
            min: 0,
            idle_timeout: Duration::from_millis(30_000),
            reap_interval: Duration::from_millis(1_000),
            acquire_timeout: None,
            drain_timeout: Duration::from_millis(30_000),
        }
    }
}

/// A target with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    pub namespace: u32,
    pub options: HashMap<String, toml::Value>,
    pub pool: PoolSettings,
}

impl ResolvedTarget {
    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(&self.host, self.port, self.namespace)
    }
}

impl TargetConfig {
    /// Target on `host:port`, namespace 0, default pool.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: Some(host.to_string()),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Builder method: select a logical namespace.
    pub fn with_namespace(self, namespace: u32) -> Self {
        Self {
            namespace: Some(namespace),
            ..self
        }
    }

    /// Builder method: set pool options.
    pub fn with_pool(self, pool: PoolOptions) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    /// Builder method: add one client option.
    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The pool key for this configuration, after host/port/namespace defaults.
    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(
            self.host.as_deref().unwrap_or(DEFAULT_HOST),
            self.port.unwrap_or(DEFAULT_PORT),
            self.namespace.unwrap_or(DEFAULT_NAMESPACE),
        )
    }

    /// Apply defaults and validate pool sizing.
    pub fn resolve(&self) -> ConfigResult<ResolvedTarget> {
        let identity = self.identity();
        let target = identity.to_string();

        let mut options = self.options.clone().unwrap_or_default();
        options
            .entry(DETECT_BUFFERS.to_string())
            .or_insert(toml::Value::Boolean(true));

        let defaults = PoolSettings::default();
        let pool = self.pool.clone().unwrap_or_default();
        let settings = PoolSettings {
            max: pool.max.unwrap_or(defaults.max),
            min: pool.min.unwrap_or(defaults.min),
            idle_timeout: pool
                .idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_timeout),
            reap_interval: pool
                .reap_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reap_interval),
            acquire_timeout: pool.acquire_timeout_ms.map(Duration::from_millis),
            drain_timeout: pool
                .drain_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
        };

        if settings.max == 0 {
            return Err(ConfigError::ZeroMax { target });
        }
        if settings.max > MAX_POOL_SIZE {
            return Err(ConfigError::MaxTooLarge {
                target,
                max: settings.max,
                limit: MAX_POOL_SIZE,
            });
        }
        if settings.min > settings.max {
            return Err(ConfigError::MinExceedsMax {
                target,
                min: settings.min,
                max: settings.max,
            });
        }
        if settings.reap_interval.is_zero() {
            return Err(ConfigError::ZeroReapInterval { target });
        }

        Ok(ResolvedTarget {
            host: identity.host,
            port: identity.port,
            namespace: identity.namespace,
            options,
            pool: settings,
        })
    }
}

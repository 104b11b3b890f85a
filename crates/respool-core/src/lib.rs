//! respool-core: shared types for the respool connection pool registry.
//!
//! - **config**: `TargetConfig` (the user-facing, all-optional TOML shape) and
//!   its resolved form with defaults applied
//! - **identity**: `TargetIdentity`, the `host:port:namespace` key that decides
//!   which pool a configuration maps to
//! - **error**: validation errors raised while resolving a configuration

pub mod config;
pub mod error;
pub mod identity;

pub use config::{MAX_POOL_SIZE, PoolOptions, PoolSettings, ResolvedTarget, TargetConfig};
pub use error::{ConfigError, ConfigResult};
pub use identity::TargetIdentity;

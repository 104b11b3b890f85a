//! Configuration error types.

use thiserror::Error;

/// Errors raised while resolving a [`TargetConfig`](crate::TargetConfig).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool max must be at least 1 (target {target})")]
    ZeroMax { target: String },

    #[error("pool max {max} exceeds the limit of {limit} (target {target})")]
    MaxTooLarge {
        target: String,
        max: usize,
        limit: usize,
    },

    #[error("pool min {min} exceeds pool max {max} (target {target})")]
    MinExceedsMax {
        target: String,
        min: usize,
        max: usize,
    },

    #[error("pool reap interval must be non-zero (target {target})")]
    ZeroReapInterval { target: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

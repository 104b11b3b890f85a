//! Client and pool error types.

use std::time::Duration;

use redis::{ErrorKind, RedisError};
use respool_core::ConfigError;
use thiserror::Error;

/// Errors surfaced by a single connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or protocol failure reported by the Redis client.
    #[error("redis error: {0}")]
    Redis(RedisError),

    /// The server answered with a `-ERR ...` reply.
    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected reply to {command}: {reply:?}")]
    UnexpectedReply {
        command: &'static str,
        reply: redis::Value,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// Whether the connection that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_unrecoverable_error()
                    || e.kind() == ErrorKind::ParseError
            }
            ClientError::Closed => true,
            _ => false,
        }
    }
}

impl From<RedisError> for ClientError {
    /// Server replies carry an error code; everything else is a client failure.
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() {
            return ClientError::Redis(e);
        }
        match (e.code(), e.detail()) {
            (Some(code), Some(detail)) => ClientError::Server(format!("{code} {detail}")),
            (Some(code), None) => ClientError::Server(code.to_string()),
            _ => ClientError::Redis(e),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by pool acquisition.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create connection for pool {pool}: {source}")]
    Create {
        pool: String,
        #[source]
        source: ClientError,
    },

    #[error("pool {0} is draining; no new connections accepted")]
    Draining(String),

    #[error("timed out after {timeout:?} waiting for a connection from pool {pool}")]
    Timeout { pool: String, timeout: Duration },

    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type PoolResult<T> = Result<T, PoolError>;

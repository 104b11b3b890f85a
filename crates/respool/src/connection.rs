//! Raw connection abstraction.
//!
//! The guardian and pool never talk to a socket directly. They drive a
//! [`RawConnection`] produced by a [`ConnectionFactory`], so tests inject
//! in-memory mocks and production uses [`RedisConnectionFactory`](crate::client::RedisConnectionFactory).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use respool_core::ResolvedTarget;
use tokio::sync::{broadcast, watch};

use crate::error::ClientResult;

/// Everything a factory needs to open one connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub namespace: u32,
    /// Client options passed through untouched from the target configuration.
    /// The bundled factory reads `connect_timeout_ms`; anything else, such as
    /// `detect_buffers`, is left for custom factories.
    pub options: HashMap<String, toml::Value>,
}

impl ConnectParams {
    pub fn new(host: &str, port: u16, namespace: u32) -> Self {
        Self {
            host: host.to_string(),
            port,
            namespace,
            options: HashMap::new(),
        }
    }

    pub fn from_target(target: &ResolvedTarget) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            namespace: target.namespace,
            options: target.options.clone(),
        }
    }

    /// `host:port` for socket connects.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Integer option interpreted as milliseconds.
    pub fn duration_option(&self, key: &str) -> Option<Duration> {
        self.options
            .get(key)
            .and_then(toml::Value::as_integer)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }
}

impl std::fmt::Display for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.namespace)
    }
}

/// One pub/sub delivery. `pattern` is set for `pmessage` frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    pub pattern: Option<String>,
    pub channel: String,
    pub payload: Bytes,
}

/// A single live protocol connection.
///
/// `closed` flips to `true` when the connection terminates for any reason;
/// the guardian watches it to detect unsolicited termination.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Issue a command and wait for its reply. `-ERR` replies are errors.
    async fn command(&self, args: &[Bytes]) -> ClientResult<redis::Value>;

    async fn subscribe(&self, channels: &[String]) -> ClientResult<()>;
    async fn unsubscribe(&self, channels: &[String]) -> ClientResult<()>;
    async fn psubscribe(&self, patterns: &[String]) -> ClientResult<()>;
    async fn punsubscribe(&self, patterns: &[String]) -> ClientResult<()>;

    /// Resolves once the connection answers a round trip.
    async fn ready(&self) -> ClientResult<()>;

    /// Pub/sub messages received on this connection.
    fn messages(&self) -> broadcast::Receiver<PubSubMessage>;

    /// Termination signal.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Force-close without a goodbye.
    fn end(&self);

    /// Graceful QUIT.
    async fn quit(&self) -> ClientResult<()>;
}

/// Opens raw connections. Injected so tests can count and fail connects.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> ClientResult<Arc<dyn RawConnection>>;
}

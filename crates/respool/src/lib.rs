//! Keyed registry of bounded Redis connection pools.
//!
//! [`PoolRegistry`] lazily builds one [`ResourcePool`] per
//! `host:port:namespace` identity and hands out [`GuardedConnection`]s.
//! A guarded connection survives server-side disconnects: its guardian
//! reconnects, reselects the namespace and resubscribes every channel and
//! pattern the handle had subscribed to.
//!
//! ```no_run
//! use respool::{PoolRegistry, TargetConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = PoolRegistry::default();
//! let target = TargetConfig::new("localhost", 6379);
//!
//! let conn = registry.acquire(&target).await?;
//! conn.set("foo", "bar").await?;
//! assert_eq!(conn.get("foo").await?.as_deref(), Some(&b"bar"[..]));
//! registry.release(&target, conn).await;
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod factory;
pub mod guardian;
pub mod pool;
pub mod registry;
pub mod subscriptions;

#[cfg(test)]
mod mock;

pub use client::{RedisConnection, RedisConnectionFactory};
pub use connection::{ConnectParams, ConnectionFactory, PubSubMessage, RawConnection};
pub use error::{ClientError, ClientResult, PoolError, PoolResult};
pub use factory::{ConnectionManager, ConnectionPool, build_pool};
pub use guardian::{GuardedConnection, GuardianSettings};
pub use pool::{Manager, PoolResource, PoolStats, ResourcePool};
pub use registry::{PoolRegistry, RegistrySettings};
pub use subscriptions::SubscriptionRecord;

pub use respool_core::{PoolOptions, PoolSettings, TargetConfig, TargetIdentity};

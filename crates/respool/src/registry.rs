//! Pool registry: one lazily built pool per target identity.
//!
//! ```text
//! acquire(config)
//!   → identity = host:port:namespace (defaults applied)
//!     → pool exists      → pool.acquire()
//!     → no pool yet      → resolve config, build pool, pool.acquire()
//! release(config, conn)
//!   → pool exists      → pool.release(conn)
//!   → unknown identity → ignored
//! ```
//!
//! Pools are never removed before [`PoolRegistry::shutdown`]; a process that
//! keeps inventing new targets keeps growing the map.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use respool_core::{TargetConfig, TargetIdentity};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::client::RedisConnectionFactory;
use crate::connection::ConnectionFactory;
use crate::error::{PoolError, PoolResult};
use crate::factory::{ConnectionPool, build_resolved_pool};
use crate::guardian::{GuardedConnection, GuardianSettings};
use crate::pool::PoolStats;

/// Registry-wide tuning applied to every connection it creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Pause between failed replacement attempts (default: 100ms).
    pub reconnect_delay: Duration,
    /// Pub/sub buffer per connection handle (default: 256).
    pub message_capacity: usize,
    /// Upper bound on the graceful QUIT when a connection is destroyed (default: 1s).
    pub quit_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let guardian = GuardianSettings::default();
        Self {
            reconnect_delay: guardian.reconnect_delay,
            message_capacity: guardian.message_capacity,
            quit_timeout: guardian.quit_timeout,
        }
    }
}

impl RegistrySettings {
    pub fn with_reconnect_delay(self, reconnect_delay: Duration) -> Self {
        Self {
            reconnect_delay,
            ..self
        }
    }

    pub fn with_message_capacity(self, message_capacity: usize) -> Self {
        Self {
            message_capacity,
            ..self
        }
    }

    pub fn with_quit_timeout(self, quit_timeout: Duration) -> Self {
        Self {
            quit_timeout,
            ..self
        }
    }

    fn guardian(&self) -> GuardianSettings {
        GuardianSettings {
            reconnect_delay: self.reconnect_delay,
            message_capacity: self.message_capacity,
            quit_timeout: self.quit_timeout,
        }
    }
}

/// Keyed collection of connection pools.
pub struct PoolRegistry {
    pools: Mutex<HashMap<TargetIdentity, ConnectionPool>>,
    factory: Arc<dyn ConnectionFactory>,
    settings: RegistrySettings,
    shut_down: AtomicBool,
}

impl Default for PoolRegistry {
    /// Registry backed by real TCP connections.
    fn default() -> Self {
        Self::new(Arc::new(RedisConnectionFactory::default()))
    }
}

impl PoolRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_settings(factory, RegistrySettings::default())
    }

    pub fn with_settings(factory: Arc<dyn ConnectionFactory>, settings: RegistrySettings) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            factory,
            settings,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// The pool for `config`'s identity, built on first use.
    ///
    /// Pool options come from whichever configuration built the pool; later
    /// configurations with the same identity reuse it unchanged.
    pub async fn pool(&self, config: &TargetConfig) -> PoolResult<ConnectionPool> {
        let identity = config.identity();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::Draining(identity.to_string()));
        }

        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&identity) {
            return Ok(pool.clone());
        }

        let target = config.resolve()?;
        let pool = build_resolved_pool(&target, Arc::clone(&self.factory), self.settings.guardian());
        pools.insert(identity.clone(), pool.clone());

        tracing::info!(
            host = %identity.host,
            port = identity.port,
            namespace = identity.namespace,
            pools = pools.len(),
            "registered new pool"
        );
        Ok(pool)
    }

    /// Check out a connection for `config`'s target.
    pub async fn acquire(&self, config: &TargetConfig) -> PoolResult<GuardedConnection> {
        let pool = self.pool(config).await?;
        pool.acquire().await
    }

    /// Return a connection to its pool. Releasing against an identity with
    /// no pool does nothing.
    pub async fn release(&self, config: &TargetConfig, conn: GuardedConnection) {
        match self.existing(config).await {
            Some(pool) => pool.release(conn),
            None => tracing::debug!(
                pool = %config.identity(),
                connection = conn.id(),
                "release for unknown pool ignored"
            ),
        }
    }

    /// The pool for `config`'s identity, if one has been built.
    pub async fn existing(&self, config: &TargetConfig) -> Option<ConnectionPool> {
        self.pools.lock().await.get(&config.identity()).cloned()
    }

    /// Identities with a pool, sorted.
    pub async fn identities(&self) -> Vec<TargetIdentity> {
        let mut identities: Vec<_> = self.pools.lock().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn stats(&self, config: &TargetConfig) -> Option<PoolStats> {
        self.existing(config).await.map(|pool| pool.stats())
    }

    /// Log statistics for every pool at `info` level.
    pub async fn log_stats(&self) {
        let pools = self.pools.lock().await;
        for (identity, pool) in pools.iter() {
            let stats = pool.stats();
            tracing::info!(
                host = %identity.host,
                port = identity.port,
                namespace = identity.namespace,
                active = stats.active,
                idle = stats.idle,
                total = stats.total,
                created = stats.created,
                destroyed = stats.destroyed,
                wait_count = stats.wait_count,
                "pool statistics"
            );
        }
    }

    /// Drain every pool concurrently, then destroy what remains.
    ///
    /// Returns the number of checked-out connections force-destroyed after
    /// their pool's drain timeout. Later acquires fail with `Draining`.
    pub async fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);
        let pools: Vec<ConnectionPool> = self.pools.lock().await.values().cloned().collect();
        tracing::info!(pools = pools.len(), "registry shutdown started");

        let mut drains = JoinSet::new();
        for pool in pools {
            drains.spawn(async move { pool.drain().await });
        }

        let mut force_destroyed = 0;
        while let Some(result) = drains.join_next().await {
            match result {
                Ok(count) => force_destroyed += count,
                Err(e) => tracing::warn!(error = %e, "pool drain task failed"),
            }
        }

        tracing::info!(force_destroyed = force_destroyed, "registry shutdown complete");
        force_destroyed
    }

    /// Run [`shutdown`](Self::shutdown) once `signal` resolves, e.g.
    /// `tokio::signal::ctrl_c()`.
    pub fn shutdown_on<F>(self: &Arc<Self>, signal: F) -> JoinHandle<usize>
    where
        F: Future + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            signal.await;
            tracing::info!("shutdown signal received");
            registry.shutdown().await
        })
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("settings", &self.settings)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

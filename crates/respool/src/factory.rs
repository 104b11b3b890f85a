//! Builds one bounded pool of guarded connections for a target.

use std::sync::Arc;

use async_trait::async_trait;
use respool_core::{ResolvedTarget, TargetConfig};

use crate::connection::{ConnectParams, ConnectionFactory};
use crate::error::{ClientResult, PoolResult};
use crate::guardian::{GuardedConnection, GuardianSettings};
use crate::pool::{Manager, PoolResource, ResourcePool};

/// Pool of guarded connections to one target.
pub type ConnectionPool = ResourcePool<ConnectionManager>;

impl PoolResource for GuardedConnection {
    fn resource_id(&self) -> u64 {
        self.id()
    }
}

/// [`Manager`] whose resources are guarded connections to one target.
pub struct ConnectionManager {
    params: ConnectParams,
    factory: Arc<dyn ConnectionFactory>,
    settings: GuardianSettings,
}

impl ConnectionManager {
    pub fn new(
        params: ConnectParams,
        factory: Arc<dyn ConnectionFactory>,
        settings: GuardianSettings,
    ) -> Self {
        Self {
            params,
            factory,
            settings,
        }
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }
}

#[async_trait]
impl Manager for ConnectionManager {
    type Resource = GuardedConnection;

    /// Connect, wrap, then ready check and namespace select. A connection
    /// that fails preparation is torn down before the error is returned.
    async fn create(&self) -> ClientResult<GuardedConnection> {
        let raw = self.factory.connect(&self.params).await?;
        let conn = GuardedConnection::wrap(
            raw,
            self.params.clone(),
            Arc::clone(&self.factory),
            self.settings.clone(),
        );
        if let Err(e) = conn.prepare().await {
            conn.destroy().await;
            return Err(e);
        }
        tracing::debug!(
            connection = conn.id(),
            addr = %self.params,
            "connection ready"
        );
        Ok(conn)
    }

    async fn destroy(&self, conn: GuardedConnection) {
        conn.destroy().await;
    }
}

/// Resolve `config` and build its pool.
pub fn build_pool(
    config: &TargetConfig,
    factory: Arc<dyn ConnectionFactory>,
    settings: GuardianSettings,
) -> PoolResult<ConnectionPool> {
    let target = config.resolve()?;
    Ok(build_resolved_pool(&target, factory, settings))
}

pub(crate) fn build_resolved_pool(
    target: &ResolvedTarget,
    factory: Arc<dyn ConnectionFactory>,
    settings: GuardianSettings,
) -> ConnectionPool {
    let manager = ConnectionManager::new(ConnectParams::from_target(target), factory, settings);
    ResourcePool::new(target.identity().to_string(), manager, target.pool.clone())
}

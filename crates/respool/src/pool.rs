//! Generic bounded resource pool.
//!
//! A [`ResourcePool`] owns a set of resources produced by a [`Manager`]:
//! idle inventory plus the resources currently checked out. A fair semaphore
//! bounds checkouts to `max` and serves waiters FIFO. A background reaper
//! destroys resources idle longer than `idle_timeout` (never dropping below
//! `min`) and tops the pool back up to `min`.
//!
//! ```text
//! acquire()
//!   → semaphore permit (wait FIFO, optional timeout)
//!     → idle resource available → reuse newest
//!     → idle empty             → Manager::create
//! release(resource)
//!   → back to idle, permit returned
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use respool_core::PoolSettings;
use tokio::sync::{Semaphore, TryAcquireError, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ClientResult, PoolError, PoolResult};

/// Creates and tears down pooled resources.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Resource: PoolResource;

    async fn create(&self) -> ClientResult<Self::Resource>;

    async fn destroy(&self, resource: Self::Resource);
}

/// A cheaply cloneable handle with a stable identity.
pub trait PoolResource: Clone + Send + Sync + 'static {
    fn resource_id(&self) -> u64;
}

/// Pool-level statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Resources currently checked out.
    pub active: usize,
    /// Resources sitting idle in the pool.
    pub idle: usize,
    /// Resources being created.
    pub pending: usize,
    /// Active + idle + pending.
    pub total: usize,
    /// Resources created over the pool's lifetime.
    pub created: u64,
    /// Resources destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Number of acquires that had to wait for a free slot.
    pub wait_count: u64,
}

struct IdleEntry<R> {
    resource: R,
    returned_at: Instant,
}

struct PoolState<R> {
    /// Oldest at the front; reuse pops from the back.
    idle: VecDeque<IdleEntry<R>>,
    in_use: HashMap<u64, R>,
    pending: usize,
    created: u64,
    destroyed: u64,
    wait_count: u64,
}

impl<R> PoolState<R> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }
}

struct ReaperSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReaperSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

struct PoolShared<M: Manager> {
    name: String,
    manager: M,
    settings: PoolSettings,
    state: Mutex<PoolState<M::Resource>>,
    semaphore: Arc<Semaphore>,
    draining: AtomicBool,
    reaper: Mutex<Option<ReaperSlot>>,
}

impl<M: Manager> Drop for PoolShared<M> {
    fn drop(&mut self) {
        if let Some(slot) = self.reaper.get_mut().take() {
            slot.stop();
        }
    }
}

/// A slot counted in `pending` while a resource is being created.
/// Dropping it unsettled (error or cancellation) frees the slot.
struct Reservation<'a, R> {
    state: &'a Mutex<PoolState<R>>,
    settled: bool,
}

impl<'a, R> Reservation<'a, R> {
    fn new(state: &'a Mutex<PoolState<R>>) -> Self {
        Self {
            state,
            settled: false,
        }
    }

    fn settle(mut self, place: impl FnOnce(&mut PoolState<R>)) {
        let state_lock = self.state;
        let mut state = state_lock.lock();
        state.pending -= 1;
        state.created += 1;
        place(&mut *state);
        self.settled = true;
    }
}

impl<R> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.lock().pending -= 1;
        }
    }
}

/// Bounded pool of resources produced by `M`. Clones share the same pool.
pub struct ResourcePool<M: Manager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: Manager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manager> std::fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.shared.name)
            .field("settings", &self.shared.settings)
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

impl<M: Manager> ResourcePool<M> {
    /// Create the pool and start its reaper. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, manager: M, settings: PoolSettings) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                manager,
                semaphore: Arc::new(Semaphore::new(settings.max.min(Semaphore::MAX_PERMITS))),
                settings,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashMap::new(),
                    pending: 0,
                    created: 0,
                    destroyed: 0,
                    wait_count: 0,
                }),
                draining: AtomicBool::new(false),
                reaper: Mutex::new(None),
            }),
        };
        pool.start_reaper();

        tracing::info!(
            pool = %pool.shared.name,
            max = pool.shared.settings.max,
            min = pool.shared.settings.min,
            idle_timeout = ?pool.shared.settings.idle_timeout,
            "created pool"
        );
        pool
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Check out a resource: newest idle one, else a fresh one if under
    /// `max`, else wait FIFO for a release.
    pub async fn acquire(&self) -> PoolResult<M::Resource> {
        let shared = &self.shared;
        if self.is_draining() {
            return Err(PoolError::Draining(shared.name.clone()));
        }

        let permit = match Arc::clone(&shared.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(PoolError::Draining(shared.name.clone()));
            }
            Err(TryAcquireError::NoPermits) => {
                shared.state.lock().wait_count += 1;
                tracing::debug!(pool = %shared.name, "pool exhausted, waiting for a release");

                let wait = Arc::clone(&shared.semaphore).acquire_owned();
                let acquired = match shared.settings.acquire_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                        PoolError::Timeout {
                            pool: shared.name.clone(),
                            timeout,
                        }
                    })?,
                    None => wait.await,
                };
                acquired.map_err(|_| PoolError::Draining(shared.name.clone()))?
            }
        };

        let reused = {
            let mut state = shared.state.lock();
            match state.idle.pop_back() {
                Some(entry) => {
                    state
                        .in_use
                        .insert(entry.resource.resource_id(), entry.resource.clone());
                    Some(entry.resource)
                }
                None => {
                    state.pending += 1;
                    None
                }
            }
        };
        if let Some(resource) = reused {
            // The permit stays acquired while the resource is checked out.
            permit.forget();
            tracing::debug!(
                pool = %shared.name,
                resource = resource.resource_id(),
                "reused idle resource"
            );
            return Ok(resource);
        }

        let reservation = Reservation::new(&shared.state);
        let resource = match shared.manager.create().await {
            Ok(resource) => resource,
            Err(source) => {
                tracing::warn!(pool = %shared.name, error = %source, "failed to create resource");
                return Err(PoolError::Create {
                    pool: shared.name.clone(),
                    source,
                });
            }
        };
        reservation.settle(|state| {
            state
                .in_use
                .insert(resource.resource_id(), resource.clone());
        });
        permit.forget();

        tracing::debug!(
            pool = %shared.name,
            resource = resource.resource_id(),
            "created new resource"
        );
        Ok(resource)
    }

    /// Return a checked-out resource to idle inventory. Resources this pool
    /// did not hand out are ignored.
    pub fn release(&self, resource: M::Resource) {
        let shared = &self.shared;
        let id = resource.resource_id();
        let mut state = shared.state.lock();
        if state.in_use.remove(&id).is_none() {
            tracing::warn!(pool = %shared.name, resource = id, "ignoring release of unknown resource");
            return;
        }
        state.idle.push_back(IdleEntry {
            resource,
            returned_at: Instant::now(),
        });
        let idle_count = state.idle.len();
        drop(state);
        shared.semaphore.add_permits(1);

        tracing::debug!(
            pool = %shared.name,
            resource = id,
            idle_count = idle_count,
            "returned resource to pool"
        );
    }

    /// Destroy idle resources older than `idle_timeout`, keeping at least
    /// `min` resources in the pool. Returns how many were destroyed.
    pub async fn reap_idle(&self) -> usize {
        let shared = &self.shared;
        let expired: Vec<M::Resource> = {
            let mut state = shared.state.lock();
            let mut removable = state.total().saturating_sub(shared.settings.min);
            let mut expired = Vec::new();
            while removable > 0 {
                let is_expired = state
                    .idle
                    .front()
                    .is_some_and(|entry| entry.returned_at.elapsed() >= shared.settings.idle_timeout);
                if !is_expired {
                    break;
                }
                if let Some(entry) = state.idle.pop_front() {
                    expired.push(entry.resource);
                }
                removable -= 1;
            }
            state.destroyed += expired.len() as u64;
            expired
        };

        let reaped = expired.len();
        for resource in expired {
            shared.manager.destroy(resource).await;
        }
        if reaped > 0 {
            tracing::info!(
                pool = %shared.name,
                reaped = reaped,
                remaining_idle = shared.state.lock().idle.len(),
                "reaped idle resources"
            );
        }
        reaped
    }

    /// Create idle resources until the pool holds `min`, never exceeding
    /// `max`. Returns how many were created.
    pub async fn ensure_minimum(&self) -> usize {
        let shared = &self.shared;
        let mut created = 0;
        loop {
            if self.is_draining() {
                break;
            }
            // Holding a permit keeps checkouts from racing this creation.
            let Ok(permit) = Arc::clone(&shared.semaphore).try_acquire_owned() else {
                break;
            };
            let reservation = {
                let mut state = shared.state.lock();
                if state.idle.len() >= shared.settings.min || state.total() >= shared.settings.max {
                    break;
                }
                state.pending += 1;
                Reservation::new(&shared.state)
            };

            match shared.manager.create().await {
                Ok(resource) => {
                    reservation.settle(|state| {
                        state.idle.push_back(IdleEntry {
                            resource,
                            returned_at: Instant::now(),
                        });
                    });
                    created += 1;
                }
                Err(e) => {
                    tracing::warn!(pool = %shared.name, error = %e, "failed to create minimum idle resource");
                    break;
                }
            }
            drop(permit);
        }
        if created > 0 {
            tracing::debug!(pool = %shared.name, created = created, "topped up idle resources");
        }
        created
    }

    /// Stop handing out resources, wait up to `drain_timeout` for checked-out
    /// ones to come back, then destroy everything.
    ///
    /// Returns the number of checked-out resources force-destroyed after the
    /// timeout expired.
    pub async fn drain(&self) -> usize {
        let shared = &self.shared;
        shared.draining.store(true, Ordering::SeqCst);
        shared.semaphore.close();
        self.stop_reaper();

        tracing::info!(
            pool = %shared.name,
            drain_timeout = ?shared.settings.drain_timeout,
            "pool draining started"
        );

        let deadline = Instant::now() + shared.settings.drain_timeout;
        let poll_interval = Duration::from_millis(50);
        loop {
            let active_count = shared.state.lock().in_use.len();
            if active_count == 0 {
                tracing::info!(pool = %shared.name, "all checked-out resources returned");
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pool = %shared.name,
                    remaining = active_count,
                    "drain timeout expired, force-destroying remaining resources"
                );
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }

        self.destroy_all_now().await
    }

    /// Destroy every idle and checked-out resource immediately.
    /// Returns the number of checked-out resources destroyed.
    pub async fn destroy_all_now(&self) -> usize {
        let shared = &self.shared;
        let (idle, in_use): (Vec<M::Resource>, Vec<M::Resource>) = {
            let mut state = shared.state.lock();
            let idle: Vec<_> = state.idle.drain(..).map(|entry| entry.resource).collect();
            let in_use: Vec<_> = state.in_use.drain().map(|(_, resource)| resource).collect();
            state.destroyed += (idle.len() + in_use.len()) as u64;
            (idle, in_use)
        };

        let force_destroyed = in_use.len();
        let idle_count = idle.len();
        for resource in idle.into_iter().chain(in_use) {
            shared.manager.destroy(resource).await;
        }

        tracing::info!(
            pool = %shared.name,
            idle = idle_count,
            force_destroyed = force_destroyed,
            "destroyed all pool resources"
        );
        force_destroyed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            active: state.in_use.len(),
            idle: state.idle.len(),
            pending: state.pending,
            total: state.total(),
            created: state.created,
            destroyed: state.destroyed,
            wait_count: state.wait_count,
        }
    }

    fn start_reaper(&self) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.settings.reap_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        let pool = ResourcePool { shared };
                        pool.reap_idle().await;
                        pool.ensure_minimum().await;
                    }
                }
            }
        });

        *self.shared.reaper.lock() = Some(ReaperSlot {
            handle,
            shutdown_tx,
        });
    }

    fn stop_reaper(&self) {
        if let Some(slot) = self.shared.reaper.lock().take() {
            slot.stop();
        }
    }
}

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::PoolError;
use crate::http::BoxError;

type CreateFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;
type Factory<T> = Box<dyn Fn() -> CreateFuture<T> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    /// Idle resources older than this are dropped instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Bookkeeping carried with each pooled resource.
#[derive(Debug, Clone, Copy)]
pub struct HandleInfo {
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    pub total_acquires: u64,
    pub total_releases: u64,
    pub total_created: u64,
    pub total_discarded: u64,
    pub total_timeouts: u64,
}

struct Idle<T> {
    resource: T,
    info: HandleInfo,
}

struct State<T> {
    idle: Vec<Idle<T>>,
    closed: bool,
    stats: PoolStats,
}

struct Shared<T> {
    name: String,
    config: PoolConfig,
    factory: Factory<T>,
    slots: Arc<Semaphore>,
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkin(&self, resource: T, mut info: HandleInfo) {
        let mut state = self.lock();
        state.stats.total_releases += 1;
        if state.closed || state.idle.len() >= self.config.max_size {
            state.stats.total_discarded += 1;
            state.stats.size = state.stats.size.saturating_sub(1);
            return;
        }
        info.last_used = Instant::now();
        state.idle.push(Idle { resource, info });
    }

    fn forget(&self) {
        let mut state = self.lock();
        state.stats.total_discarded += 1;
        state.stats.size = state.stats.size.saturating_sub(1);
    }
}

/// A slot reserved for a resource being created. Dropping it unkept, on
/// factory error or when the acquire times out, frees the slot.
struct Reservation<'a, T> {
    shared: &'a Shared<T>,
    kept: bool,
}

impl<T> Reservation<'_, T> {
    fn keep(mut self) {
        self.kept = true;
        let mut state = self.shared.lock();
        state.stats.total_created += 1;
        state.stats.total_acquires += 1;
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.kept {
            let mut state = self.shared.lock();
            state.stats.size = state.stats.size.saturating_sub(1);
        }
    }
}

/// Bounded pool of reusable resources, such as client connections, created
/// on demand by an async factory.
///
/// Idle resources are reused most-recent-first. At most `max_size`
/// resources exist at once; `acquire` waits up to `acquire_timeout` for one
/// to come back.
pub struct ResourcePool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new<F, Fut, E>(name: impl Into<String>, factory: F, config: PoolConfig) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let max_size = config.max_size.max(1);
        let config = PoolConfig { max_size, ..config };
        let factory: Factory<T> = Box::new(move || -> CreateFuture<T> {
            let fut = factory();
            Box::pin(async move { fut.await.map_err(Into::into) })
        });
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                factory,
                slots: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(State {
                    idle: Vec::new(),
                    closed: false,
                    stats: PoolStats {
                        max_size,
                        ..Default::default()
                    },
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Borrow a resource, reusing an idle one or creating one while under
    /// `max_size`.
    pub async fn acquire(&self) -> Result<Pooled<T>, PoolError> {
        let timeout = self.shared.config.acquire_timeout;
        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.lock().stats.total_timeouts += 1;
                tracing::warn!(
                    pool = %self.shared.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for a pooled resource"
                );
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    async fn checkout(&self) -> Result<Pooled<T>, PoolError> {
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let reused = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let idle_timeout = self.shared.config.idle_timeout;
            let mut found = None;
            // LIFO: the most recently returned resource is the warmest
            while let Some(idle) = state.idle.pop() {
                if idle.info.last_used.elapsed() < idle_timeout {
                    found = Some(idle);
                    break;
                }
                state.stats.total_discarded += 1;
                state.stats.size = state.stats.size.saturating_sub(1);
            }
            if found.is_some() {
                state.stats.total_acquires += 1;
            } else {
                // Reserve the slot before creating outside the lock
                state.stats.size += 1;
            }
            found
        };

        let (resource, info) = match reused {
            Some(Idle { resource, mut info }) => {
                info.use_count += 1;
                info.last_used = Instant::now();
                (resource, info)
            }
            None => {
                let reservation = Reservation {
                    shared: &self.shared,
                    kept: false,
                };
                let resource = (self.shared.factory)().await.map_err(|e| {
                    tracing::warn!(pool = %self.shared.name, error = %e, "failed to create pooled resource");
                    PoolError::Create(e)
                })?;
                reservation.keep();
                tracing::debug!(pool = %self.shared.name, "created pooled resource");
                let now = Instant::now();
                (
                    resource,
                    HandleInfo {
                        created_at: now,
                        last_used: now,
                        use_count: 1,
                    },
                )
            }
        };

        Ok(Pooled {
            resource: Some(resource),
            info,
            pool: self.shared.clone(),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let mut stats = state.stats;
        stats.idle = state.idle.len();
        stats.in_use = stats.size.saturating_sub(stats.idle);
        stats
    }

    /// Close the pool and drop idle resources. Borrowed resources are
    /// dropped as they come back; waiting and later `acquire` calls fail
    /// with [`PoolError::Closed`].
    pub fn drain(&self) {
        let idle = {
            let mut state = self.shared.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.stats.total_discarded += idle.len() as u64;
            state.stats.size = state.stats.size.saturating_sub(idle.len());
            idle
        };
        self.shared.slots.close();
        tracing::info!(pool = %self.shared.name, dropped = idle.len(), "pool drained");
    }
}

/// Type-erased handle so a [`Guard`](crate::guard::Guard) can drain pools of
/// any resource type at shutdown.
#[async_trait]
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> PoolStats;
    async fn drain(&self);
}

#[async_trait]
impl<T: Send + 'static> Drain for ResourcePool<T> {
    fn name(&self) -> &str {
        ResourcePool::name(self)
    }

    fn stats(&self) -> PoolStats {
        ResourcePool::stats(self)
    }

    async fn drain(&self) {
        ResourcePool::drain(self)
    }
}

/// A borrowed resource. Returned to the pool when dropped.
pub struct Pooled<T> {
    resource: Option<T>,
    info: HandleInfo,
    pool: Arc<Shared<T>>,
    // Declared last so the slot frees only after the resource is back
    _permit: OwnedSemaphorePermit,
}

impl<T> Pooled<T> {
    pub fn info(&self) -> &HandleInfo {
        &self.info
    }

    /// Return the resource to the pool now.
    pub fn release(self) {
        drop(self)
    }

    /// Drop the resource instead of returning it (e.g. a broken
    /// connection), freeing its slot for a fresh one.
    pub fn discard(mut self) {
        if self.resource.take().is_some() {
            self.pool.forget();
            tracing::debug!(pool = %self.pool.name, "discarded pooled resource");
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `discard` and `drop` take the resource, and both consume the handle
        self.resource.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.checkin(resource, self.info);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("resource", &self.resource)
            .field("info", &self.info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_pool(config: PoolConfig) -> (ResourcePool<u32>, Arc<AtomicU32>) {
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();
        let pool = ResourcePool::new(
            "test",
            move || {
                let id = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, BoxError>(id) }
            },
            config,
        );
        (pool, created)
    }

    #[tokio::test]
    async fn released_resource_is_reused() {
        let (pool, created) = counting_pool(PoolConfig::default());
        let first = pool.acquire().await.unwrap();
        assert_eq!(*first, 0);
        assert_eq!(first.info().use_count, 1);
        first.release();

        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, 0);
        assert_eq!(again.info().use_count, 2);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total_acquires, 2);
        assert_eq!(stats.total_releases, 1);
    }

    #[tokio::test]
    async fn most_recently_returned_goes_out_first() {
        let (pool, _) = counting_pool(PoolConfig::default());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_times_out() {
        let (pool, _) = counting_pool(PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert_eq!(pool.stats().total_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_returned_resource() {
        let (pool, created) = counting_pool(PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discard_frees_the_slot() {
        let (pool, created) = counting_pool(PoolConfig {
            max_size: 1,
            ..Default::default()
        });
        pool.acquire().await.unwrap().discard();
        assert_eq!(*pool.acquire().await.unwrap(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expired_resources_are_replaced() {
        let (pool, _) = counting_pool(PoolConfig {
            idle_timeout: Duration::from_secs(30),
            ..Default::default()
        });
        drop(pool.acquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(*pool.acquire().await.unwrap(), 1);
        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_discarded, 1);
    }

    #[tokio::test]
    async fn drained_pool_rejects_acquire() {
        let (pool, _) = counting_pool(PoolConfig::default());
        let held = pool.acquire().await.unwrap();
        drop(pool.acquire().await.unwrap());
        pool.drain();
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        drop(held);
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn factory_errors_surface() {
        let pool: ResourcePool<u32> = ResourcePool::new(
            "broken",
            || async { Err::<u32, _>("connection refused") },
            PoolConfig::default(),
        );
        assert!(matches!(pool.acquire().await, Err(PoolError::Create(_))));
        assert_eq!(pool.stats().size, 0);
    }
}

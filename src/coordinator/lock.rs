use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use super::Coordinator;
use crate::error::LockError;

const LOCK_PREFIX: &str = "lock:";
const BASE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

fn lock_key(resource: &str) -> String {
    format!("{LOCK_PREFIX}{resource}")
}

/// `base * 2^attempt`, capped, with up to 50% random jitter so contending
/// replicas do not poll in lockstep.
fn backoff_delay(attempt: u32) -> Duration {
    let delay = BASE_BACKOFF
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .min(MAX_BACKOFF);
    let jitter = rand::rng().random_range(0.5..=1.0);
    delay.mul_f64(jitter)
}

impl Coordinator {
    /// Try to take the lock on `resource` for `ttl` (default `lock_ttl`),
    /// polling with backoff until `timeout` has passed. A zero timeout makes
    /// exactly one attempt. Locks are not reentrant.
    ///
    /// The owner token lives in the returned [`LockGuard`], so only the
    /// caller holding it can release the lock, even among tasks sharing
    /// this coordinator.
    pub async fn acquire_lock(
        &self,
        resource: &str,
        timeout: Duration,
        ttl: Option<Duration>,
    ) -> Option<LockGuard> {
        let key = lock_key(resource);
        let ttl = ttl.unwrap_or(self.inner.config.lock_ttl);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        let mut attempt = 0u32;
        loop {
            if self.store().set_if_absent(&key, &token, Some(ttl)).await {
                tracing::debug!(resource, attempts = attempt + 1, ttl_ms = ttl.as_millis() as u64, "lock acquired");
                return Some(LockGuard {
                    coordinator: self.clone(),
                    resource: resource.to_string(),
                    token: Some(token),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(resource, attempts = attempt + 1, "lock acquisition timed out");
                return None;
            }
            let delay = backoff_delay(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release a lock taken by [`acquire_lock`](Self::acquire_lock). Returns
    /// `false` without touching the store's value when the lock expired and
    /// may now belong to someone else.
    pub async fn release_lock(&self, lock: LockGuard) -> bool {
        lock.release().await
    }

    async fn release_token(&self, resource: &str, token: &str) -> bool {
        let released = self.store().compare_and_delete(&lock_key(resource), token).await;
        if released {
            tracing::debug!(resource, "lock released");
        } else {
            tracing::warn!(resource, "lock expired before release");
        }
        released
    }

    /// Run `f` while holding the lock on `resource`; the lock is released on
    /// every exit path of `f`, including panics unwinding through the await.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        timeout: Duration,
        ttl: Option<Duration>,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let started = Instant::now();
        let Some(lock) = self.acquire_lock(resource, timeout, ttl).await else {
            return Err(LockError::AcquisitionTimeout {
                resource: resource.to_string(),
                waited: started.elapsed(),
            });
        };

        let out = f().await;
        lock.release().await;
        Ok(out)
    }
}

/// Proof of holding the lock on one resource.
///
/// Carries the owner token written to the store. Release it with
/// [`release`](Self::release); dropping it unreleased (cancellation, panic)
/// releases in the background. Either way the store value is deleted only
/// if it still holds this guard's token.
#[must_use = "dropping a LockGuard releases the lock"]
pub struct LockGuard {
    coordinator: Coordinator,
    resource: String,
    token: Option<String>,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release now. Returns `false` if the lock had already expired.
    pub async fn release(mut self) -> bool {
        match self.token.take() {
            Some(token) => self.coordinator.release_token(&self.resource, &token).await,
            None => false,
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let coordinator = self.coordinator.clone();
        let resource = std::mem::take(&mut self.resource);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    coordinator.release_token(&resource, &token).await;
                });
            }
            Err(_) => {
                // No runtime left; the TTL reclaims the lock
                tracing::warn!(resource = %resource, "lock left to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::coordinator::CoordinatorConfig;
    use crate::store::{LocalStore, SharedStore};

    fn coordinator(store: SharedStore, clock: &ManualClock) -> Coordinator {
        Coordinator::new(store, clock.shared(), CoordinatorConfig::default())
    }

    #[test]
    fn backoff_grows_then_caps() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= MAX_BACKOFF);
            assert!(d >= BASE_BACKOFF / 2);
        }
        assert!(backoff_delay(10) >= MAX_BACKOFF / 2);
    }

    #[tokio::test]
    async fn zero_timeout_makes_a_single_attempt() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let a = coordinator(store.clone(), &clock);
        let b = coordinator(store, &clock);

        let _held = a.acquire_lock("x", Duration::ZERO, None).await.unwrap();
        let started = std::time::Instant::now();
        assert!(b.acquire_lock("x", Duration::ZERO, None).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_holder_releases() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let a = coordinator(store.clone(), &clock);
        let b = coordinator(store, &clock);

        let held = a.acquire_lock("job", Duration::ZERO, None).await.unwrap();
        let waiter = tokio::spawn(async move {
            b.acquire_lock("job", Duration::from_secs(2), None)
                .await
                .map(|lock| lock.resource().to_string())
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(a.release_lock(held).await);
        assert_eq!(waiter.await.unwrap().as_deref(), Some("job"));
    }

    #[tokio::test]
    async fn lock_expires_by_ttl() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let a = coordinator(store.clone(), &clock);
        let b = coordinator(store, &clock);

        let stale = a
            .acquire_lock("x", Duration::ZERO, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));
        let _current = b.acquire_lock("x", Duration::ZERO, None).await.unwrap();

        // The expired holder cannot release the new owner's lock
        assert!(!stale.release().await);
        assert!(a.acquire_lock("x", Duration::ZERO, None).await.is_none());
    }

    #[tokio::test]
    async fn stale_holder_on_same_coordinator_cannot_release_successor() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let coord = coordinator(store, &clock);

        let first = coord
            .acquire_lock("job", Duration::ZERO, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));
        let second = coord.acquire_lock("job", Duration::ZERO, None).await.unwrap();

        assert!(!coord.release_lock(first).await);
        assert!(
            coord.acquire_lock("job", Duration::ZERO, None).await.is_none(),
            "second holder must still own the lock"
        );
        assert!(coord.release_lock(second).await);
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let coord = coordinator(store, &clock);

        drop(coord.acquire_lock("x", Duration::ZERO, None).await.unwrap());
        let reacquired = coord.acquire_lock("x", Duration::from_secs(1), None).await;
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn with_lock_serializes_and_releases() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let a = coordinator(store.clone(), &clock);
        let b = coordinator(store, &clock);
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let out = a
            .with_lock("x", Duration::ZERO, None, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "done"
            })
            .await
            .unwrap();
        assert_eq!(out, "done");
        let _held = b.acquire_lock("x", Duration::ZERO, None).await.unwrap();

        let counter = runs.clone();
        let err = a
            .with_lock("x", Duration::ZERO, None, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AcquisitionTimeout { ref resource, .. } if resource == "x"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_with_lock_body_keeps_successor_lock() {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let coord = coordinator(store, &clock);

        let successor = coord
            .with_lock("x", Duration::ZERO, Some(Duration::from_secs(1)), || async {
                clock.advance(Duration::from_secs(2));
                coord.acquire_lock("x", Duration::ZERO, None).await
            })
            .await
            .unwrap()
            .expect("expired lock is free again");

        assert!(coord.acquire_lock("x", Duration::ZERO, None).await.is_none());
        assert!(successor.release().await);
    }
}

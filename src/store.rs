mod local;
mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

pub use self::local::LocalStore;
pub use self::redis::RedisStore;
use crate::error::StoreError;

/// How long a failed remote is bypassed before it is tried again.
const REMOTE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Inputs for one atomic token-bucket step.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub capacity: f64,
    /// Tokens added per second.
    pub rate: f64,
    /// Current time in seconds since the Unix epoch.
    pub now: f64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens left after this step.
    pub tokens: f64,
}

/// Inputs for one atomic sliding-window step.
#[derive(Debug, Clone)]
pub struct WindowParams {
    pub max_requests: u64,
    /// Window length in seconds.
    pub window: f64,
    pub now: f64,
    pub ttl: Duration,
    /// Unique member recorded for this request if it is admitted.
    pub member: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Requests inside the window before this one was considered.
    pub count: u64,
    /// Timestamp of the oldest request still inside the window.
    pub oldest: Option<f64>,
}

/// Backend storage shared by every replica.
///
/// Two implementations exist: [`RedisStore`] for a real remote store and
/// [`LocalStore`] for a process-local table. Keys are plain strings in the
/// namespaces `ratelimit:`, `lock:`, `instances:`, `session:` and
/// `conversation:`.
///
/// [`token_bucket`](Self::token_bucket) and
/// [`sliding_window`](Self::sliding_window) must each run as one atomic step
/// per key, so that concurrent checks from several processes never admit
/// more than the configured limit.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Write `value` only if `key` does not exist. Returns `true` on write.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Members of a sorted set with `min <= score <= max`, lowest first.
    async fn sorted_range(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    async fn token_bucket(&self, key: &str, params: BucketParams)
    -> Result<BucketOutcome, StoreError>;

    async fn sliding_window(
        &self,
        key: &str,
        params: WindowParams,
    ) -> Result<WindowOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Whether the process shares state with other replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Distributed,
    LocalOnly,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMode::Distributed => f.write_str("distributed"),
            StoreMode::LocalOnly => f.write_str("local-only"),
        }
    }
}

struct Inner {
    mode: StoreMode,
    /// Taken on close, which drops the connection.
    remote: Mutex<Option<Arc<dyn Store>>>,
    local: LocalStore,
    degraded: AtomicBool,
    retry_at: Mutex<Option<Instant>>,
}

/// The store every component talks to.
///
/// Built once at startup with an optional remote. Each operation goes to the
/// remote when one is configured; if the remote fails, the operation is
/// answered from the process-local table instead and the failure is logged
/// (once when entering the degraded state, once on recovery). Callers never
/// see store errors and never branch on availability.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Inner>,
}

macro_rules! remote_first {
    ($self:ident, $op:literal, $remote:ident => $call:expr, $local:expr) => {{
        if let Some($remote) = $self.remote() {
            match $call.await {
                Ok(v) => {
                    $self.mark_healthy();
                    return v;
                }
                Err(e) => $self.mark_degraded($op, &e),
            }
        }
        $local
    }};
}

impl SharedStore {
    /// A store with no remote backing: every replica keeps its own state.
    pub fn local_only(local: LocalStore) -> Self {
        Self::build(None, local)
    }

    /// A store backed by `remote`, falling back to `local` on failure.
    pub fn distributed(remote: Arc<dyn Store>, local: LocalStore) -> Self {
        Self::build(Some(remote), local)
    }

    fn build(remote: Option<Arc<dyn Store>>, local: LocalStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode: if remote.is_some() {
                    StoreMode::Distributed
                } else {
                    StoreMode::LocalOnly
                },
                remote: Mutex::new(remote),
                local,
                degraded: AtomicBool::new(false),
                retry_at: Mutex::new(None),
            }),
        }
    }

    /// The mode the store was built with. Closing does not change it.
    pub fn mode(&self) -> StoreMode {
        self.inner.mode
    }

    /// `true` while the remote is failing and local state is in use.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    /// Drop the remote. Its connection closes once in-flight calls finish,
    /// and later calls are served locally.
    pub fn close(&self) {
        let remote = self
            .inner
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if remote.is_some() {
            tracing::info!(mode = %self.mode(), "shared store closed");
        }
    }

    fn remote(&self) -> Option<Arc<dyn Store>> {
        let remote = self
            .inner
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let retry_at = self
            .inner
            .retry_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *retry_at {
            Some(at) if Instant::now() < at => None,
            _ => Some(remote),
        }
    }

    fn mark_degraded(&self, op: &'static str, err: &StoreError) {
        *self
            .inner
            .retry_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + REMOTE_RETRY_INTERVAL);
        if !self.inner.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                op,
                error = %err,
                "shared store unavailable, falling back to local state"
            );
        } else {
            tracing::debug!(op, error = %err, "shared store still unavailable");
        }
    }

    fn mark_healthy(&self) {
        if self.inner.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("shared store recovered");
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        remote_first!(self, "get", r => r.get(key), self.inner.local.get(key))
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        remote_first!(
            self,
            "set",
            r => r.set(key, value, ttl),
            self.inner.local.set(key, value, ttl)
        )
    }

    pub async fn delete(&self, key: &str) -> bool {
        remote_first!(self, "delete", r => r.delete(key), self.inner.local.delete(key))
    }

    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        remote_first!(
            self,
            "set_if_absent",
            r => r.set_if_absent(key, value, ttl),
            self.inner.local.set_if_absent(key, value, ttl)
        )
    }

    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> bool {
        remote_first!(
            self,
            "compare_and_delete",
            r => r.compare_and_delete(key, expected),
            self.inner.local.compare_and_delete(key, expected)
        )
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        remote_first!(
            self,
            "expire",
            r => r.expire(key, ttl),
            self.inner.local.expire(key, ttl)
        )
    }

    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        remote_first!(self, "keys", r => r.keys(prefix), self.inner.local.keys(prefix))
    }

    pub async fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        remote_first!(
            self,
            "hash_get_all",
            r => r.hash_get_all(key),
            self.inner.local.hash_get_all(key)
        )
    }

    pub async fn sorted_range(&self, key: &str, min: f64, max: f64) -> Vec<(String, f64)> {
        remote_first!(
            self,
            "sorted_range",
            r => r.sorted_range(key, min, max),
            self.inner.local.sorted_range(key, min, max)
        )
    }

    pub async fn token_bucket(&self, key: &str, params: BucketParams) -> BucketOutcome {
        remote_first!(
            self,
            "token_bucket",
            r => r.token_bucket(key, params),
            self.inner.local.token_bucket(key, params)
        )
    }

    pub async fn sliding_window(&self, key: &str, params: WindowParams) -> WindowOutcome {
        remote_first!(
            self,
            "sliding_window",
            r => r.sliding_window(key, params.clone()),
            self.inner.local.sliding_window(key, &params)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    /// A remote that is always down.
    struct Unreachable;

    #[async_trait]
    impl Store for Unreachable {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_if_absent(
            &self,
            _: &str,
            _: &str,
            _: Option<Duration>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn compare_and_delete(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn hash_get_all(&self, _: &str) -> Result<HashMap<String, String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn sorted_range(
            &self,
            _: &str,
            _: f64,
            _: f64,
        ) -> Result<Vec<(String, f64)>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn token_bucket(&self, _: &str, _: BucketParams) -> Result<BucketOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn sliding_window(
            &self,
            _: &str,
            _: WindowParams,
        ) -> Result<WindowOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn local() -> LocalStore {
        LocalStore::new(ManualClock::starting_now().shared())
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back_to_local_state() {
        let store = SharedStore::distributed(Arc::new(Unreachable), local());
        assert_eq!(store.mode(), StoreMode::Distributed);
        assert!(!store.is_degraded());

        store.set("session:a", "i-1", None).await;
        assert!(store.is_degraded());
        assert_eq!(store.get("session:a").await.as_deref(), Some("i-1"));
        assert!(store.set_if_absent("lock:x", "t1", None).await);
        assert!(!store.set_if_absent("lock:x", "t2", None).await);
    }

    #[tokio::test]
    async fn healthy_remote_is_authoritative() {
        let remote = local();
        let store = SharedStore::distributed(Arc::new(remote.clone()), local());

        store.set("k", "v", None).await;
        assert_eq!(remote.get("k").as_deref(), Some("v"));
        assert!(store.local().get("k").is_none());
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn closed_store_stops_using_remote() {
        let remote = local();
        let store = SharedStore::distributed(Arc::new(remote.clone()), local());
        store.close();
        store.set("k", "v", None).await;
        assert!(remote.get("k").is_none());
        assert_eq!(store.local().get("k").as_deref(), Some("v"));
        assert_eq!(store.mode(), StoreMode::Distributed);
    }

    #[tokio::test]
    async fn close_drops_the_remote_connection() {
        let remote: Arc<dyn Store> = Arc::new(local());
        let store = SharedStore::distributed(remote.clone(), local());
        let replica = store.clone();
        store.get("k").await;
        assert_eq!(Arc::strong_count(&remote), 2);

        replica.close();
        assert_eq!(Arc::strong_count(&remote), 1);
        // Closing twice is harmless
        store.close();
        assert_eq!(Arc::strong_count(&remote), 1);
    }
}

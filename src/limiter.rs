mod sliding_window;
mod token_bucket;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::clock::{Clock, SharedClock};
use crate::store::SharedStore;

const DEFAULT_STATE_TTL: Duration = Duration::from_secs(3600);

/// Who is being limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    Ip(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// An identity scoped by a named window, rendered as `user:42:minute`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub identity: Identity,
    pub window: String,
}

impl RateLimitKey {
    pub fn new(identity: Identity, window: impl Into<String>) -> Self {
        Self {
            identity,
            window: window.into(),
        }
    }

    pub fn user(id: impl Into<String>, window: impl Into<String>) -> Self {
        Self::new(Identity::User(id.into()), window)
    }

    pub fn ip(addr: impl Into<String>, window: impl Into<String>) -> Self {
        Self::new(Identity::Ip(addr.into()), window)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.window)
    }
}

/// `max_requests` per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub max_requests: u64,
    pub window_seconds: u64,
}

impl Limit {
    pub fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds: window_seconds.max(1),
        }
    }

    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, 60)
    }

    pub fn per_hour(max_requests: u64) -> Self {
        Self::new(max_requests, 3600)
    }
}

/// A named limit applied by [`RateLimiter::check_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLimit {
    pub name: String,
    pub limit: Limit,
}

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix time (seconds) at which the caller's allowance is fully restored.
    pub reset_at: u64,
    /// Seconds to wait before retrying, set only on denial.
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// `X-RateLimit-*` headers, plus `Retry-After` when denied.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at));
        if let Some(retry_after) = self.retry_after {
            headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        headers
    }
}

/// Which algorithm a [`RateLimiter`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Bursts up to the limit, refilling continuously.
    #[default]
    TokenBucket,
    /// Exact count of requests in the trailing window.
    SlidingWindow,
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "token_bucket" | "token-bucket" => Ok(Algorithm::TokenBucket),
            "sliding_window" | "sliding-window" => Ok(Algorithm::SlidingWindow),
            other => Err(format!("unknown rate limit algorithm '{other}'")),
        }
    }
}

/// Per-caller rate limiter over the [`SharedStore`].
///
/// Each check is one atomic store step, so replicas sharing a remote store
/// enforce a single limit between them. When the store has no remote (or the
/// remote is down) every replica enforces its own limit from local state;
/// store failures never turn into denials.
///
/// Cheaply cloneable.
///
/// # Examples
///
/// ```rust,no_run
/// use fleetguard::clock;
/// use fleetguard::limiter::{Algorithm, RateLimitKey, RateLimiter};
/// use fleetguard::store::{LocalStore, SharedStore};
///
/// # async fn demo() {
/// let clock = clock::system();
/// let store = SharedStore::local_only(LocalStore::new(clock.clone()));
/// let limiter = RateLimiter::new(store, clock, Algorithm::SlidingWindow);
///
/// let key = RateLimitKey::user("42", "minute");
/// let result = limiter.check(&key.to_string(), 60, 60).await;
/// if !result.allowed {
///     println!("retry in {:?}s", result.retry_after);
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    clock: SharedClock,
    algorithm: Algorithm,
    state_ttl: Duration,
    windows: Arc<[WindowLimit]>,
}

impl RateLimiter {
    pub fn new(store: SharedStore, clock: SharedClock, algorithm: Algorithm) -> Self {
        Self {
            store,
            clock,
            algorithm,
            state_ttl: DEFAULT_STATE_TTL,
            windows: Arc::from(vec![
                WindowLimit {
                    name: "minute".into(),
                    limit: Limit::per_minute(60),
                },
                WindowLimit {
                    name: "hour".into(),
                    limit: Limit::per_hour(1000),
                },
            ]),
        }
    }

    /// How long idle limiter state survives in the store. Refreshed on every
    /// write. Defaults to one hour.
    pub fn state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Windows checked by [`check_identity`](Self::check_identity).
    pub fn default_windows(mut self, windows: Vec<WindowLimit>) -> Self {
        self.windows = Arc::from(windows);
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn windows(&self) -> &[WindowLimit] {
        &self.windows
    }

    /// Consume one request for `key` against `max_requests` per
    /// `window_seconds`.
    pub async fn check(&self, key: &str, max_requests: u64, window_seconds: u64) -> RateLimitResult {
        let limit = Limit::new(max_requests, window_seconds);
        let now = self.clock.now_secs();
        let result = match self.algorithm {
            Algorithm::TokenBucket => {
                token_bucket::check(&self.store, key, limit, now, self.state_ttl).await
            }
            Algorithm::SlidingWindow => {
                sliding_window::check(&self.store, key, limit, now, self.state_ttl).await
            }
        };
        if !result.allowed {
            tracing::debug!(
                key,
                limit = limit.max_requests,
                window_secs = limit.window_seconds,
                retry_after = result.retry_after,
                "rate limit exceeded"
            );
        }
        result
    }

    /// Check every default window for `identity`.
    ///
    /// Windows are checked in order and the first denial is returned without
    /// consuming from later windows. When all allow, the result with the
    /// fewest remaining requests is returned.
    pub async fn check_identity(&self, identity: &Identity) -> RateLimitResult {
        let mut tightest: Option<RateLimitResult> = None;
        for window in self.windows.iter() {
            let key = RateLimitKey::new(identity.clone(), window.name.clone());
            let result = self
                .check(
                    &key.to_string(),
                    window.limit.max_requests,
                    window.limit.window_seconds,
                )
                .await;
            if !result.allowed {
                return result;
            }
            if tightest
                .as_ref()
                .is_none_or(|t| result.remaining < t.remaining)
            {
                tightest = Some(result);
            }
        }
        tightest.unwrap_or(RateLimitResult {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at: self.clock.now().as_secs(),
            retry_after: None,
        })
    }

    /// Report the current allowance for `key` without consuming anything.
    pub async fn peek(&self, key: &str, max_requests: u64, window_seconds: u64) -> RateLimitResult {
        let limit = Limit::new(max_requests, window_seconds);
        let now = self.clock.now_secs();
        match self.algorithm {
            Algorithm::TokenBucket => token_bucket::peek(&self.store, key, limit, now).await,
            Algorithm::SlidingWindow => sliding_window::peek(&self.store, key, limit, now).await,
        }
    }

    /// Forget all state for `key`.
    pub async fn reset(&self, key: &str) {
        self.store.delete(&token_bucket::state_key(key)).await;
        self.store.delete(&sliding_window::state_key(key)).await;
    }
}

/// Round up to whole seconds, ignoring float noise below a microsecond.
fn ceil_secs(secs: f64) -> u64 {
    (secs - 1e-6).ceil().max(0.0) as u64
}

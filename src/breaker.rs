use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::clock::{Clock, SharedClock};
use crate::error::{BreakerError, CircuitOpenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` that close it again.
    pub success_threshold: u32,
    /// Time `Open` must last (since the last failure) before probing.
    pub timeout: Duration,
    /// Concurrent probes admitted while `HalfOpen`.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view of one breaker, for logs and status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    /// Unix seconds of the most recent failure.
    pub last_failure_time: Option<f64>,
    /// Unix seconds at which the breaker last opened.
    pub opened_at: Option<f64>,
}

struct State {
    circuit: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    /// Bumped on every entry into `HalfOpen`, so probe slots from an earlier
    /// half-open episode are never returned to a later one.
    generation: u64,
    last_failure_time: Option<Duration>,
    opened_at: Option<Duration>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

struct Inner {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    state: Mutex<State>,
}

/// Fault-tolerance state machine for one named dependency.
///
/// `Closed` passes calls through and counts consecutive failures; reaching
/// `failure_threshold` trips it to `Open`, which rejects immediately. Once
/// `timeout` has passed since the last failure, the next call moves it to
/// `HalfOpen` (checked lazily, no timer) and up to `half_open_max_calls`
/// probes are let through at a time. `success_threshold` consecutive probe
/// successes close it; any probe failure reopens it.
///
/// Cheaply cloneable; clones share state.
///
/// # Examples
///
/// ```rust,no_run
/// use fleetguard::breaker::{BreakerConfig, CircuitBreaker};
/// use fleetguard::clock;
///
/// # async fn demo() {
/// let breaker = CircuitBreaker::new("grader-llm", BreakerConfig::default(), clock::system());
/// let reply = breaker
///     .call(|| async { Ok::<_, std::io::Error>("graded") })
///     .await;
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                clock,
                state: Mutex::new(State {
                    circuit: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                    half_open_in_flight: 0,
                    generation: 0,
                    last_failure_time: None,
                    opened_at: None,
                    total_calls: 0,
                    total_successes: 0,
                    total_failures: 0,
                    total_rejections: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, applying a pending `Open` → `HalfOpen` transition.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.circuit
    }

    /// Run `f` under the breaker. Any `Err` counts as a failure.
    ///
    /// Returns [`BreakerError::Open`] without calling `f` when the breaker
    /// is open or its half-open probe quota is in use.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.record(true);
                Ok(value)
            }
            Err(e) => {
                permit.record(false);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Ask to make one call. The returned permit must be resolved with
    /// [`CallPermit::record`]; dropping it unresolved (e.g. on cancellation)
    /// frees any probe slot without counting an outcome.
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitOpenError> {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.total_calls += 1;

        match state.circuit {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self.clone(),
                probe: None,
                resolved: false,
            }),
            CircuitState::HalfOpen if state.half_open_in_flight < self.inner.config.half_open_max_calls => {
                state.half_open_in_flight += 1;
                Ok(CallPermit {
                    breaker: self.clone(),
                    probe: Some(state.generation),
                    resolved: false,
                })
            }
            CircuitState::HalfOpen => {
                state.total_rejections += 1;
                Err(self.open_error(None))
            }
            CircuitState::Open => {
                state.total_rejections += 1;
                let now = self.inner.clock.now();
                let reopens = state
                    .last_failure_time
                    .map(|at| (at + self.inner.config.timeout).saturating_sub(now));
                Err(self.open_error(reopens))
            }
        }
    }

    fn open_error(&self, retry_after: Option<Duration>) -> CircuitOpenError {
        CircuitOpenError {
            name: self.inner.name.clone(),
            retry_after,
        }
    }

    fn maybe_half_open(&self, state: &mut State) {
        if state.circuit != CircuitState::Open {
            return;
        }
        let now = self.inner.clock.now();
        let elapsed = state
            .last_failure_time
            .map(|at| now.saturating_sub(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.inner.config.timeout {
            state.circuit = CircuitState::HalfOpen;
            state.generation += 1;
            state.half_open_in_flight = 0;
            state.success_count = 0;
            tracing::info!(breaker = %self.inner.name, "circuit half-open, probing");
        }
    }

    fn on_success(&self, state: &mut State) {
        state.total_successes += 1;
        match state.circuit {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.inner.config.success_threshold {
                    state.circuit = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                    tracing::info!(breaker = %self.inner.name, "circuit closed");
                }
            }
            // A call admitted before the breaker tripped
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, state: &mut State) {
        state.total_failures += 1;
        let now = self.inner.clock.now();
        match state.circuit {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.last_failure_time = Some(now);
                if state.failure_count >= self.inner.config.failure_threshold {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(now);
                    tracing::warn!(
                        breaker = %self.inner.name,
                        failures = state.failure_count,
                        timeout_ms = self.inner.config.timeout.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.circuit = CircuitState::Open;
                state.last_failure_time = Some(now);
                state.opened_at = Some(now);
                state.success_count = 0;
                tracing::warn!(breaker = %self.inner.name, "probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to `Closed` and clear its counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.circuit = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_in_flight = 0;
        state.opened_at = None;
        tracing::info!(breaker = %self.inner.name, "circuit reset");
    }

    pub fn stats(&self) -> BreakerStats {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        BreakerStats {
            name: self.inner.name.clone(),
            state: state.circuit,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_in_flight: state.half_open_in_flight,
            total_calls: state.total_calls,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            last_failure_time: state.last_failure_time.map(|d| d.as_secs_f64()),
            opened_at: state.opened_at.map(|d| d.as_secs_f64()),
        }
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
pub struct CallPermit {
    breaker: CircuitBreaker,
    /// Half-open generation this permit holds a probe slot in.
    probe: Option<u64>,
    resolved: bool,
}

impl CallPermit {
    /// Report the outcome of the call.
    pub fn record(mut self, success: bool) {
        let mut state = self.breaker.lock();
        self.release_probe(&mut state);
        if success {
            self.breaker.on_success(&mut state);
        } else {
            self.breaker.on_failure(&mut state);
        }
        self.resolved = true;
    }

    fn release_probe(&self, state: &mut State) {
        if let Some(generation) = self.probe
            && state.circuit == CircuitState::HalfOpen
            && state.generation == generation
        {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut state = self.breaker.lock();
        self.release_probe(&mut state);
    }
}

/// Process-wide set of named breakers.
///
/// Repeated lookups for the same dependency share one breaker. Not
/// distributed: each replica protects itself from a bad dependency on its
/// own.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    default_config: BreakerConfig,
    clock: SharedClock,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            default_config,
            clock,
        }
    }

    /// The breaker for `name`, created with `config` if it does not exist
    /// yet. An existing breaker keeps its original config.
    pub fn get(&self, name: &str, config: BreakerConfig) -> CircuitBreaker {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "registered circuit breaker");
                CircuitBreaker::new(name, config, self.clock.clone())
            })
            .clone()
    }

    /// The breaker for `name` with the registry's default config.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        self.get(name, self.default_config)
    }

    pub fn reset(&self, name: &str) -> bool {
        let breaker = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    /// Stats for every registered breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let breakers: Vec<CircuitBreaker> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::breaker::{BreakerRegistry, BreakerStats};
use crate::clock::{self, SharedClock};
use crate::config::GuardConfig;
use crate::coordinator::{Coordinator, InstanceRecord};
use crate::executor::{ExecutorStats, TaskExecutor};
use crate::gate::RequestGate;
use crate::limiter::RateLimiter;
use crate::pool::{Drain, PoolStats};
use crate::store::{LocalStore, RedisStore, SharedStore, StoreMode};

/// Snapshot of every component, for health and status endpoints.
#[derive(Debug, Serialize)]
pub struct GuardStatus {
    pub instance_id: String,
    pub mode: String,
    pub degraded: bool,
    pub instances: Vec<InstanceRecord>,
    pub breakers: Vec<BreakerStats>,
    pub executor: ExecutorStats,
    pub pools: Vec<NamedPoolStats>,
}

#[derive(Debug, Serialize)]
pub struct NamedPoolStats {
    pub name: String,
    #[serde(flatten)]
    pub stats: PoolStats,
}

/// Owns the resilience components of one process.
///
/// Built once at startup and handed to request handlers by reference;
/// nothing is reachable through globals. [`shutdown`](Self::shutdown)
/// tears the components down in dependency order.
pub struct Guard {
    store: SharedStore,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    executor: TaskExecutor,
    coordinator: Coordinator,
    gate: RequestGate,
    pools: Mutex<Vec<Arc<dyn Drain>>>,
    drain_timeout: Duration,
    shut_down: AtomicBool,
}

impl Guard {
    /// Connect the store, build every component, register this instance
    /// and start its heartbeat.
    pub async fn start(config: &GuardConfig) -> anyhow::Result<Arc<Self>> {
        let clock = clock::system();
        let local = LocalStore::new(clock.clone());
        let store = match &config.store.url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(remote) => SharedStore::distributed(Arc::new(remote), local),
                Err(e) => {
                    tracing::warn!(error = %e, "shared store unreachable at startup, running local-only");
                    SharedStore::local_only(local)
                }
            },
            None => SharedStore::local_only(local),
        };

        let guard = Arc::new(Self::with_store(store, clock, config));
        guard
            .coordinator
            .start_heartbeat()
            .await
            .context("failed to register instance")?;
        tracing::info!(
            instance_id = guard.coordinator.instance_id(),
            mode = %guard.store.mode(),
            "guard started"
        );
        Ok(guard)
    }

    /// Build every component over an existing store without registering.
    pub fn with_store(store: SharedStore, clock: SharedClock, config: &GuardConfig) -> Self {
        let limiter = RateLimiter::new(store.clone(), clock.clone(), config.algorithm())
            .state_ttl(config.rate_limit_state_ttl())
            .default_windows(config.rate_limit_windows());
        let breakers = BreakerRegistry::new(config.breaker_config(), clock.clone());
        let executor = TaskExecutor::new(config.workers(), config.task_timeout());
        let coordinator = Coordinator::new(store.clone(), clock, config.coordinator_config());
        let gate = RequestGate::new(limiter.clone(), breakers.clone(), executor.clone());

        Self {
            store,
            limiter,
            breakers,
            executor,
            coordinator,
            gate,
            pools: Mutex::new(Vec::new()),
            drain_timeout: config.drain_timeout(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn mode(&self) -> StoreMode {
        self.store.mode()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// Hand a pool to the guard so it is drained on shutdown.
    pub fn register_pool(&self, pool: impl Drain + 'static) {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(pool));
    }

    fn registered_pools(&self) -> Vec<Arc<dyn Drain>> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn status(&self) -> GuardStatus {
        GuardStatus {
            instance_id: self.coordinator.instance_id().to_string(),
            mode: self.store.mode().to_string(),
            degraded: self.store.is_degraded(),
            instances: self.coordinator.get_active_instances().await,
            breakers: self.breakers.snapshot(),
            executor: self.executor.stats(),
            pools: self
                .registered_pools()
                .iter()
                .map(|p| NamedPoolStats {
                    name: p.name().to_string(),
                    stats: p.stats(),
                })
                .collect(),
        }
    }

    /// Deregister the instance, drain the executor, drain registered pools
    /// and close the store, in that order. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down");
        self.coordinator.deregister().await;
        self.executor.shutdown(self.drain_timeout).await;
        for pool in self.registered_pools() {
            pool.drain().await;
        }
        self.store.close();
        tracing::info!("shutdown complete");
    }
}

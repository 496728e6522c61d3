pub mod breaker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod gate;
pub mod guard;
pub mod http;
pub mod limiter;
pub mod pool;
pub mod store;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use config::GuardConfig;
pub use coordinator::{Coordinator, LockGuard};
pub use error::{BreakerError, CircuitOpenError, LockError, RateLimitExceeded, TaskError};
pub use executor::TaskExecutor;
pub use gate::{CircuitBreakerLayer, ClientAddr, GateError, RateLimitLayer, RequestGate};
pub use guard::Guard;
pub use limiter::{Identity, RateLimitResult, RateLimiter};
pub use pool::{PoolConfig, Pooled, ResourcePool};
pub use store::{SharedStore, StoreMode};

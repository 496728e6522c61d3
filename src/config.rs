use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::coordinator::CoordinatorConfig;
use crate::error::ConfigError;
use crate::limiter::{Algorithm, Limit, WindowLimit};

const ENV_PREFIX: &str = "FLEETGUARD_";

/// Top-level configuration, loaded from TOML and then overridden from the
/// environment. Every field is optional; unset fields take defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub coordinator: CoordinatorSection,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Remote store URL, e.g. "redis://127.0.0.1:6379/0". Unset means
    /// local-only mode.
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// "token_bucket" (default) or "sliding_window".
    pub algorithm: Option<Algorithm>,
    /// Default: 60.
    pub per_minute: Option<u64>,
    /// Default: 1000.
    pub per_hour: Option<u64>,
    /// Lifetime of idle limiter state, e.g. "1h". Default: 3600s.
    pub state_ttl: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSection {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    /// How long the breaker stays open, e.g. "60s".
    pub timeout: Option<DurationValue>,
    pub half_open_max_calls: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSection {
    pub instance_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub instance_ttl: Option<DurationValue>,
    pub heartbeat_interval: Option<DurationValue>,
    pub lock_ttl: Option<DurationValue>,
    pub session_ttl: Option<DurationValue>,
    pub conversation_ttl: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Default: 10.
    pub workers: Option<usize>,
    /// Default deadline for blocking tasks, e.g. "30s".
    pub task_timeout: Option<DurationValue>,
    /// How long shutdown waits for in-flight tasks. Default: 10s.
    pub drain_timeout: Option<DurationValue>,
}

/// A single duration, deserialized from a string like `"10s"` or `"200ms"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

/// Parse `"200ms"`, `"1.5s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_millis(n))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: f64 = secs.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Duration::try_from_secs_f64(n).map_err(|e| format!("invalid duration: {e}"))
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: u64 = mins.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_secs(n * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_secs(n * 3600))
    } else {
        Err(format!("expected duration like '200ms' or '1s', got '{s}'"))
    }
}

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

fn or_default(value: Option<DurationValue>, default: Duration) -> Duration {
    value.map(|d| d.0).unwrap_or(default)
}

impl GuardConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from `path` if given (defaults otherwise), then apply the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Override fields from `FLEETGUARD_*` variables (and `REDIS_URL` for
    /// the store) looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            lookup(&var).map(|value| (var, value))
        };

        if let Some(url) = lookup(&format!("{ENV_PREFIX}STORE_URL")).or_else(|| lookup("REDIS_URL")) {
            self.store.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some((var, v)) = get("RATE_LIMIT_PER_MINUTE") {
            self.rate_limit.per_minute = Some(parse_env(&var, &v)?);
        }
        if let Some((var, v)) = get("RATE_LIMIT_PER_HOUR") {
            self.rate_limit.per_hour = Some(parse_env(&var, &v)?);
        }
        if let Some((var, v)) = get("RATE_LIMIT_ALGORITHM") {
            self.rate_limit.algorithm = Some(parse_env(&var, &v)?);
        }
        if let Some((var, v)) = get("BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = Some(parse_env(&var, &v)?);
        }
        if let Some((var, v)) = get("BREAKER_SUCCESS_THRESHOLD") {
            self.breaker.success_threshold = Some(parse_env(&var, &v)?);
        }
        if let Some((var, v)) = get("BREAKER_TIMEOUT") {
            self.breaker.timeout = Some(env_duration(&var, &v)?);
        }
        if let Some((var, v)) = get("LOCK_TTL") {
            self.coordinator.lock_ttl = Some(env_duration(&var, &v)?);
        }
        if let Some((var, v)) = get("HEARTBEAT_INTERVAL") {
            self.coordinator.heartbeat_interval = Some(env_duration(&var, &v)?);
        }
        if let Some(id) = lookup(&format!("{ENV_PREFIX}INSTANCE_ID")).filter(|id| !id.is_empty()) {
            self.coordinator.instance_id = Some(id);
        }
        if let Some((var, v)) = get("WORKER_POOL_SIZE") {
            self.executor.workers = Some(parse_env(&var, &v)?);
        }
        if let Some((var, v)) = get("TASK_TIMEOUT") {
            self.executor.task_timeout = Some(env_duration(&var, &v)?);
        }
        Ok(())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.rate_limit.algorithm.unwrap_or_default()
    }

    /// The per-identity windows checked on every request.
    pub fn rate_limit_windows(&self) -> Vec<WindowLimit> {
        vec![
            WindowLimit {
                name: "minute".into(),
                limit: Limit::per_minute(self.rate_limit.per_minute.unwrap_or(60)),
            },
            WindowLimit {
                name: "hour".into(),
                limit: Limit::per_hour(self.rate_limit.per_hour.unwrap_or(1000)),
            },
        ]
    }

    pub fn rate_limit_state_ttl(&self) -> Duration {
        or_default(self.rate_limit.state_ttl, Duration::from_secs(3600))
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        let defaults = BreakerConfig::default();
        BreakerConfig {
            failure_threshold: self
                .breaker
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            success_threshold: self
                .breaker
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
            timeout: or_default(self.breaker.timeout, defaults.timeout),
            half_open_max_calls: self
                .breaker
                .half_open_max_calls
                .unwrap_or(defaults.half_open_max_calls)
                .max(1),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let defaults = CoordinatorConfig::default();
        let c = &self.coordinator;
        let heartbeat_interval = or_default(c.heartbeat_interval, defaults.heartbeat_interval)
            .max(MIN_HEARTBEAT_INTERVAL);
        let mut instance_ttl = or_default(c.instance_ttl, defaults.instance_ttl);
        // A record must survive at least one missed heartbeat
        if instance_ttl < heartbeat_interval * 2 {
            let raised = heartbeat_interval * 2;
            tracing::warn!(
                instance_ttl_s = instance_ttl.as_secs_f64(),
                heartbeat_interval_s = heartbeat_interval.as_secs_f64(),
                raised_to_s = raised.as_secs_f64(),
                "instance_ttl too short for heartbeat_interval, raising it"
            );
            instance_ttl = raised;
        }
        CoordinatorConfig {
            instance_id: c.instance_id.clone(),
            host: c.host.clone().unwrap_or(defaults.host),
            port: c.port.unwrap_or(defaults.port),
            instance_ttl,
            heartbeat_interval,
            lock_ttl: or_default(c.lock_ttl, defaults.lock_ttl),
            session_ttl: or_default(c.session_ttl, defaults.session_ttl),
            conversation_ttl: or_default(c.conversation_ttl, defaults.conversation_ttl),
        }
    }

    pub fn workers(&self) -> usize {
        self.executor.workers.unwrap_or(10).max(1)
    }

    pub fn task_timeout(&self) -> Duration {
        or_default(self.executor.task_timeout, Duration::from_secs(30))
    }

    pub fn drain_timeout(&self) -> Duration {
        or_default(self.executor.drain_timeout, Duration::from_secs(10))
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

/// Bare numbers are seconds; otherwise the same syntax as config files.
fn env_duration(var: &str, value: &str) -> Result<DurationValue, ConfigError> {
    let value = value.trim();
    let parsed = match value.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => parse_duration(value),
    };
    parsed.map(DurationValue).map_err(|reason| ConfigError::Env {
        var: var.to_string(),
        reason,
    })
}

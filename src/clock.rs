use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, expressed as the offset from the Unix epoch.
///
/// Everything that persists timestamps (bucket refill times, window entries,
/// TTL deadlines, heartbeats) reads time through this trait so that replicas
/// agree on a common epoch and tests can drive time by hand.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;

    /// Seconds since the epoch with sub-second precision.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
///
/// Cloning shares the underlying time, so a test can hand one copy to the
/// component under test and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(start.as_micros() as u64)),
        }
    }

    /// Start at a fixed, realistic epoch offset.
    pub fn starting_now() -> Self {
        Self::new(Duration::from_secs(1_700_000_000))
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.micros.store(to.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

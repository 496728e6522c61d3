mod instances;
mod lock;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use self::instances::{InstanceRecord, InstanceStatus};
pub use self::lock::LockGuard;
use crate::clock::{Clock, SharedClock};
use crate::store::{SharedStore, StoreMode};

const SESSION_PREFIX: &str = "session:";
const CONVERSATION_PREFIX: &str = "conversation:";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Generated (UUID v4) when not set.
    pub instance_id: Option<String>,
    pub host: String,
    pub port: u16,
    /// Lifetime of an instance record without a heartbeat.
    pub instance_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub lock_ttl: Duration,
    pub session_ttl: Duration,
    pub conversation_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            host: "127.0.0.1".to_string(),
            port: 8080,
            instance_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(30),
            session_ttl: Duration::from_secs(3600),
            conversation_ttl: Duration::from_secs(3600),
        }
    }
}

struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    store: SharedStore,
    clock: SharedClock,
    config: CoordinatorConfig,
    instance_id: String,
    started_at: f64,
    heartbeat: Mutex<Option<Heartbeat>>,
}

/// Cross-instance coordination over the [`SharedStore`]: instance registry
/// with heartbeats, session affinity, mutual-exclusion locks and a
/// best-effort conversation cache.
///
/// Without a remote store every view is local to this process: the registry
/// holds only this instance and locks exclude only other tasks in the same
/// process.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(store: SharedStore, clock: SharedClock, config: CoordinatorConfig) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match store.mode() {
            StoreMode::Distributed => {
                tracing::info!(instance_id = %instance_id, "coordinator running in distributed mode")
            }
            StoreMode::LocalOnly => tracing::warn!(
                instance_id = %instance_id,
                "no shared store configured, coordination is local to this process"
            ),
        }
        let started_at = clock.now_secs();
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                config,
                instance_id,
                started_at,
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn mode(&self) -> StoreMode {
        self.inner.store.mode()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub(crate) fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub(crate) fn now_secs(&self) -> f64 {
        self.inner.clock.now_secs()
    }

    fn heartbeat_slot(&self) -> std::sync::MutexGuard<'_, Option<Heartbeat>> {
        self.inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Session affinity

    /// Pin `session_id` to this instance.
    pub async fn assign_session(&self, session_id: &str, ttl: Option<Duration>) {
        let instance_id = self.inner.instance_id.clone();
        self.assign_session_to(session_id, &instance_id, ttl).await;
    }

    /// Pin `session_id` to `instance_id`, replacing any earlier owner.
    pub async fn assign_session_to(&self, session_id: &str, instance_id: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.inner.config.session_ttl);
        self.inner
            .store
            .set(&session_key(session_id), instance_id, Some(ttl))
            .await;
        tracing::debug!(session_id, instance_id, ttl_s = ttl.as_secs(), "session assigned");
    }

    /// The instance owning `session_id`, if the pin has not expired.
    pub async fn lookup_session(&self, session_id: &str) -> Option<String> {
        self.inner.store.get(&session_key(session_id)).await
    }

    pub async fn release_session(&self, session_id: &str) -> bool {
        self.inner.store.delete(&session_key(session_id)).await
    }

    // Conversation cache

    /// Cached state for a conversation thread. Entries that no longer
    /// decode as `T` read as absent.
    pub async fn get_conversation_state<T: DeserializeOwned>(&self, thread_id: &str) -> Option<T> {
        let raw = self
            .inner
            .store
            .get(&conversation_key(thread_id))
            .await?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(thread_id, error = %e, "discarding undecodable conversation state");
                None
            }
        }
    }

    /// Store state for a conversation thread. Last writer wins.
    pub async fn save_conversation_state<T: Serialize>(
        &self,
        thread_id: &str,
        state: &T,
        ttl: Option<Duration>,
    ) -> Result<(), serde_json::Error> {
        let raw = serde_json::to_string(state)?;
        let ttl = ttl.unwrap_or(self.inner.config.conversation_ttl);
        self.inner
            .store
            .set(&conversation_key(thread_id), &raw, Some(ttl))
            .await;
        Ok(())
    }

    pub async fn delete_conversation_state(&self, thread_id: &str) -> bool {
        self.inner.store.delete(&conversation_key(thread_id)).await
    }
}

fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

fn conversation_key(thread_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{thread_id}")
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LocalStore;

    fn coordinator(id: &str) -> (Coordinator, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = SharedStore::local_only(LocalStore::new(clock.shared()));
        let config = CoordinatorConfig {
            instance_id: Some(id.to_string()),
            ..Default::default()
        };
        (Coordinator::new(store, clock.shared(), config), clock)
    }

    #[tokio::test]
    async fn sessions_pin_until_ttl() {
        let (c, clock) = coordinator("i-1");
        c.assign_session("s-1", Some(Duration::from_secs(10))).await;
        c.assign_session_to("s-2", "i-2", None).await;

        assert_eq!(c.lookup_session("s-1").await.as_deref(), Some("i-1"));
        assert_eq!(c.lookup_session("s-2").await.as_deref(), Some("i-2"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(c.lookup_session("s-1").await, None);
        assert!(c.release_session("s-2").await);
        assert_eq!(c.lookup_session("s-2").await, None);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Thread {
        turns: Vec<String>,
    }

    #[tokio::test]
    async fn conversation_state_round_trips_and_last_writer_wins() {
        let (c, _) = coordinator("i-1");
        assert_eq!(c.get_conversation_state::<Thread>("t").await, None);

        c.save_conversation_state("t", &Thread { turns: vec!["hi".into()] }, None)
            .await
            .unwrap();
        c.save_conversation_state("t", &Thread { turns: vec!["bye".into()] }, None)
            .await
            .unwrap();
        assert_eq!(
            c.get_conversation_state::<Thread>("t").await,
            Some(Thread { turns: vec!["bye".into()] })
        );

        assert!(c.delete_conversation_state("t").await);
        assert_eq!(c.get_conversation_state::<Thread>("t").await, None);
    }

    #[tokio::test]
    async fn undecodable_conversation_state_reads_as_absent() {
        let (c, _) = coordinator("i-1");
        c.store().set("conversation:t", "not json", None).await;
        assert_eq!(c.get_conversation_state::<Thread>("t").await, None);
    }
}

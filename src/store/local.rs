use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{BucketOutcome, BucketParams, Store, WindowOutcome, WindowParams};
use crate::clock::SharedClock;
use crate::error::StoreError;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    /// Kept sorted by score, ascending.
    Sorted(Vec<(f64, String)>),
}

struct Entry {
    value: Value,
    expires_at: Option<Duration>,
}

impl Entry {
    fn is_expired(&self, now: Duration) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Table {
    entries: HashMap<String, Entry>,
    next_cleanup: Duration,
}

impl Table {
    fn maybe_cleanup(&mut self, now: Duration) {
        if now < self.next_cleanup {
            return;
        }
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.next_cleanup = now + CLEANUP_INTERVAL;
    }

    fn purge_if_expired(&mut self, key: &str, now: Duration) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    /// The entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Duration) -> Option<&mut Entry> {
        self.purge_if_expired(key, now);
        self.entries.get_mut(key)
    }
}

fn deadline(now: Duration, ttl: Option<Duration>) -> Option<Duration> {
    ttl.map(|ttl| now + ttl)
}

/// Process-local key-value table.
///
/// Used on its own when no remote store is configured and as the fallback
/// when the remote fails. Every operation runs under one mutex, so
/// read-modify-write steps on a key never interleave. Expired keys are
/// dropped lazily on access and by a periodic sweep.
///
/// Cheaply cloneable; clones share the same table.
#[derive(Clone)]
pub struct LocalStore {
    table: Arc<Mutex<Table>>,
    clock: SharedClock,
}

impl LocalStore {
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                next_cleanup: now + CLEANUP_INTERVAL,
            })),
            clock,
        }
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut Table, Duration) -> T) -> T {
        let now = self.clock.now();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.maybe_cleanup(now);
        f(&mut table, now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.with_table(|t, now| t.entries.values().filter(|e| !e.is_expired(now)).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.with_table(|t, now| match t.live(key, now) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.with_table(|t, now| {
            t.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: deadline(now, ttl),
                },
            );
        })
    }

    pub fn delete(&self, key: &str) -> bool {
        self.with_table(|t, now| {
            let existed = t.live(key, now).is_some();
            t.entries.remove(key);
            existed
        })
    }

    pub fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        self.with_table(|t, now| {
            if t.live(key, now).is_some() {
                return false;
            }
            t.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: deadline(now, ttl),
                },
            );
            true
        })
    }

    pub fn compare_and_delete(&self, key: &str, expected: &str) -> bool {
        self.with_table(|t, now| {
            let matches = matches!(
                t.live(key, now),
                Some(Entry { value: Value::Str(s), .. }) if s.as_str() == expected
            );
            if matches {
                t.entries.remove(key);
            }
            matches
        })
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.with_table(|t, now| match t.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        })
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.with_table(|t, now| {
            let mut keys: Vec<String> = t
                .entries
                .iter()
                .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            keys
        })
    }

    pub fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        self.with_table(|t, now| match t.live(key, now) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => fields.clone(),
            _ => HashMap::new(),
        })
    }

    pub fn sorted_range(&self, key: &str, min: f64, max: f64) -> Vec<(String, f64)> {
        self.with_table(|t, now| match t.live(key, now) {
            Some(Entry {
                value: Value::Sorted(items),
                ..
            }) => items
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
            _ => Vec::new(),
        })
    }

    pub fn token_bucket(&self, key: &str, params: BucketParams) -> BucketOutcome {
        self.with_table(|t, now| {
            let (stored_tokens, stored_refill) = match t.live(key, now) {
                Some(Entry {
                    value: Value::Hash(fields),
                    ..
                }) => (
                    fields.get("tokens").and_then(|v| v.parse::<f64>().ok()),
                    fields.get("last_refill").and_then(|v| v.parse::<f64>().ok()),
                ),
                _ => (None, None),
            };
            let tokens = stored_tokens.unwrap_or(params.capacity);
            let last_refill = stored_refill.unwrap_or(params.now);

            let elapsed = (params.now - last_refill).max(0.0);
            let mut tokens = (tokens + elapsed * params.rate).min(params.capacity);
            let allowed = tokens >= 1.0;
            if allowed {
                tokens -= 1.0;
            }

            let mut fields = HashMap::with_capacity(2);
            fields.insert("tokens".to_string(), tokens.to_string());
            fields.insert("last_refill".to_string(), params.now.to_string());
            t.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(fields),
                    expires_at: Some(now + params.ttl),
                },
            );

            BucketOutcome { allowed, tokens }
        })
    }

    pub fn sliding_window(&self, key: &str, params: &WindowParams) -> WindowOutcome {
        self.with_table(|t, now| {
            let cutoff = params.now - params.window;
            t.purge_if_expired(key, now);
            let entry = t.entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Sorted(Vec::new()),
                expires_at: Some(now + params.ttl),
            });
            if !matches!(entry.value, Value::Sorted(_)) {
                entry.value = Value::Sorted(Vec::new());
            }
            let Value::Sorted(items) = &mut entry.value else {
                unreachable!("window entry is a sorted set");
            };

            // Drain entries that have slid out of the window
            items.retain(|(score, _)| *score > cutoff);
            let count = items.len() as u64;
            let oldest = items.first().map(|(score, _)| *score);

            let allowed = count < params.max_requests;
            if allowed {
                let at = items.partition_point(|(score, _)| *score <= params.now);
                items.insert(at, (params.now, params.member.clone()));
                entry.expires_at = Some(now + params.ttl);
            }

            WindowOutcome {
                allowed,
                count,
                oldest,
            }
        })
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(LocalStore::get(self, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        LocalStore::set(self, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(LocalStore::delete(self, key))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        Ok(LocalStore::set_if_absent(self, key, value, ttl))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        Ok(LocalStore::compare_and_delete(self, key, expected))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(LocalStore::expire(self, key, ttl))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(LocalStore::keys(self, prefix))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(LocalStore::hash_get_all(self, key))
    }

    async fn sorted_range(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        Ok(LocalStore::sorted_range(self, key, min, max))
    }

    async fn token_bucket(
        &self,
        key: &str,
        params: BucketParams,
    ) -> Result<BucketOutcome, StoreError> {
        Ok(LocalStore::token_bucket(self, key, params))
    }

    async fn sliding_window(
        &self,
        key: &str,
        params: WindowParams,
    ) -> Result<WindowOutcome, StoreError> {
        Ok(LocalStore::sliding_window(self, key, &params))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

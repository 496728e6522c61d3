//! Runs against a live Redis. Start one and run
//! `FLEETGUARD_STORE_URL=redis://127.0.0.1:6379/15 cargo test --test redis_store -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use fleetguard::clock::ManualClock;
use fleetguard::limiter::{Algorithm, RateLimiter};
use fleetguard::store::{LocalStore, RedisStore, SharedStore, Store};
use uuid::Uuid;

async fn redis() -> Option<RedisStore> {
    let url = std::env::var("FLEETGUARD_STORE_URL")
        .or_else(|_| std::env::var("REDIS_URL"))
        .ok()?;
    Some(RedisStore::connect(&url).await.expect("redis reachable"))
}

/// A distinct namespace per test run so runs never see each other's keys.
fn namespace() -> String {
    format!("fleetguard-test:{}", Uuid::new_v4().simple())
}

fn limiter(redis: RedisStore, clock: &ManualClock, algorithm: Algorithm) -> (RateLimiter, SharedStore) {
    let store = SharedStore::distributed(Arc::new(redis), LocalStore::new(clock.shared()));
    (RateLimiter::new(store.clone(), clock.shared(), algorithm), store)
}

#[tokio::test]
#[ignore = "needs a Redis server in FLEETGUARD_STORE_URL or REDIS_URL"]
async fn token_bucket_script_allows_burst_then_denies() {
    let Some(redis) = redis().await else { return };
    let clock = ManualClock::starting_now();
    let (limiter, store) = limiter(redis.clone(), &clock, Algorithm::TokenBucket);
    let key = namespace();

    for remaining in (0..5).rev() {
        let result = limiter.check(&key, 5, 60).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, remaining);
    }
    let denied = limiter.check(&key, 5, 60).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(12));
    assert!(!store.is_degraded(), "checks must have run on redis");

    let fields = redis.hash_get_all(&format!("ratelimit:{key}")).await.unwrap();
    let tokens: f64 = fields["tokens"].parse().unwrap();
    assert!(tokens.abs() < 1e-9, "tokens = {tokens}");

    // One token back after a fifth of the window
    clock.advance(Duration::from_secs(12));
    assert!(limiter.check(&key, 5, 60).await.allowed);

    limiter.reset(&key).await;
    assert!(redis.get(&format!("ratelimit:{key}")).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "needs a Redis server in FLEETGUARD_STORE_URL or REDIS_URL"]
async fn sliding_window_script_counts_trailing_window() {
    let Some(redis) = redis().await else { return };
    let clock = ManualClock::starting_now();
    let (limiter, store) = limiter(redis.clone(), &clock, Algorithm::SlidingWindow);
    let key = namespace();

    for _ in 0..3 {
        assert!(limiter.check(&key, 3, 60).await.allowed);
        clock.advance(Duration::from_secs(10));
    }
    let denied = limiter.check(&key, 3, 60).await;
    assert!(!denied.allowed);
    // The first request leaves the window 60s after it was made
    assert_eq!(denied.retry_after, Some(30));
    assert!(!store.is_degraded());

    let window_key = format!("ratelimit:window:{key}");
    assert_eq!(redis.sorted_range(&window_key, f64::MIN, f64::MAX).await.unwrap().len(), 3);

    clock.advance(Duration::from_secs(31));
    assert!(limiter.check(&key, 3, 60).await.allowed);
    let members = redis.sorted_range(&window_key, f64::MIN, f64::MAX).await.unwrap();
    assert_eq!(members.len(), 3, "expired entry must be evicted: {members:?}");

    redis.delete(&window_key).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a Redis server in FLEETGUARD_STORE_URL or REDIS_URL"]
async fn set_if_absent_and_compare_and_delete() {
    let Some(redis) = redis().await else { return };
    let key = format!("{}:lock", namespace());

    assert!(redis.set_if_absent(&key, "owner-a", Some(Duration::from_secs(30))).await.unwrap());
    assert!(!redis.set_if_absent(&key, "owner-b", None).await.unwrap());
    assert_eq!(redis.get(&key).await.unwrap().as_deref(), Some("owner-a"));

    assert!(!redis.compare_and_delete(&key, "owner-b").await.unwrap());
    assert!(redis.get(&key).await.unwrap().is_some());
    assert!(redis.compare_and_delete(&key, "owner-a").await.unwrap());
    assert!(!redis.compare_and_delete(&key, "owner-a").await.unwrap());

    // Expiry is honored server-side
    assert!(redis.set_if_absent(&key, "owner-c", Some(Duration::from_millis(50))).await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(redis.set_if_absent(&key, "owner-d", None).await.unwrap());
    assert!(redis.delete(&key).await.unwrap());
}

#[tokio::test]
#[ignore = "needs a Redis server in FLEETGUARD_STORE_URL or REDIS_URL"]
async fn keys_scans_by_prefix() {
    let Some(redis) = redis().await else { return };
    let ns = namespace();
    let mut expected: Vec<String> = (0..250).map(|i| format!("{ns}:instance:{i:03}")).collect();
    for key in &expected {
        redis.set(key, "{}", Some(Duration::from_secs(60))).await.unwrap();
    }
    redis.set(&format!("{ns}:session:x"), "a", Some(Duration::from_secs(60))).await.unwrap();

    let found = redis.keys(&format!("{ns}:instance:")).await.unwrap();
    expected.sort();
    assert_eq!(found, expected);

    for key in redis.keys(&ns).await.unwrap() {
        redis.delete(&key).await.unwrap();
    }
    assert!(redis.keys(&ns).await.unwrap().is_empty());
}

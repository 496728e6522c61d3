use std::time::Duration;

use super::{Limit, RateLimitResult, ceil_secs};
use crate::store::{BucketParams, SharedStore};

pub(super) fn state_key(key: &str) -> String {
    format!("ratelimit:{key}")
}

/// Capacity is the request limit; tokens refill at `limit / window` per
/// second, so a full bucket allows a burst of `limit` and a steady state of
/// `limit` per window.
fn params(limit: Limit, now: f64, ttl: Duration) -> BucketParams {
    let capacity = limit.max_requests as f64;
    BucketParams {
        capacity,
        rate: capacity / limit.window_seconds as f64,
        now,
        ttl,
    }
}

fn result(limit: Limit, allowed: bool, tokens: f64, now: f64) -> RateLimitResult {
    let capacity = limit.max_requests as f64;
    let window = limit.window_seconds as f64;
    // Seconds per token, computed from the window to keep whole-token waits exact
    let per_token = if capacity > 0.0 { window / capacity } else { window };

    let reset_at = now + (capacity - tokens).max(0.0) * per_token;
    let retry_after = (!allowed).then(|| ceil_secs((1.0 - tokens) * per_token).max(1));

    RateLimitResult {
        allowed,
        limit: limit.max_requests,
        remaining: tokens.max(0.0).floor() as u64,
        reset_at: ceil_secs(reset_at),
        retry_after,
    }
}

pub(super) async fn check(
    store: &SharedStore,
    key: &str,
    limit: Limit,
    now: f64,
    ttl: Duration,
) -> RateLimitResult {
    let outcome = store
        .token_bucket(&state_key(key), params(limit, now, ttl))
        .await;
    result(limit, outcome.allowed, outcome.tokens, now)
}

pub(super) async fn peek(store: &SharedStore, key: &str, limit: Limit, now: f64) -> RateLimitResult {
    let fields = store.hash_get_all(&state_key(key)).await;
    let BucketParams { capacity, rate, .. } = params(limit, now, Duration::ZERO);

    let tokens = fields
        .get("tokens")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(capacity);
    let last_refill = fields
        .get("last_refill")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(now);
    let tokens = (tokens + (now - last_refill).max(0.0) * rate).min(capacity);

    result(limit, tokens >= 1.0, tokens, now)
}

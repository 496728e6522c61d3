use std::time::Duration;

use uuid::Uuid;

use super::{Limit, RateLimitResult, ceil_secs};
use crate::store::{SharedStore, WindowParams};

pub(super) fn state_key(key: &str) -> String {
    format!("ratelimit:window:{key}")
}

/// Sliding window log: one timestamp per admitted request. Entries at or
/// before `now - window` are dropped before counting, so no trailing window
/// ever holds more than `max_requests` admissions. There is no burst
/// allowance beyond the limit itself.
pub(super) async fn check(
    store: &SharedStore,
    key: &str,
    limit: Limit,
    now: f64,
    ttl: Duration,
) -> RateLimitResult {
    let window = limit.window_seconds as f64;
    let outcome = store
        .sliding_window(
            &state_key(key),
            WindowParams {
                max_requests: limit.max_requests,
                window,
                now,
                ttl,
                member: format!("{now:.6}-{}", Uuid::new_v4().simple()),
            },
        )
        .await;

    // Oldest entry determines when a slot opens
    let oldest = outcome.oldest.unwrap_or(now);
    if outcome.allowed {
        RateLimitResult {
            allowed: true,
            limit: limit.max_requests,
            remaining: limit.max_requests - outcome.count - 1,
            reset_at: ceil_secs(oldest + window),
            retry_after: None,
        }
    } else {
        RateLimitResult {
            allowed: false,
            limit: limit.max_requests,
            remaining: 0,
            reset_at: ceil_secs(oldest + window),
            retry_after: Some(ceil_secs(oldest + window - now).max(1)),
        }
    }
}

pub(super) async fn peek(store: &SharedStore, key: &str, limit: Limit, now: f64) -> RateLimitResult {
    let window = limit.window_seconds as f64;
    let cutoff = now - window;
    let entries: Vec<f64> = store
        .sorted_range(&state_key(key), cutoff, now)
        .await
        .into_iter()
        .map(|(_, score)| score)
        .filter(|score| *score > cutoff)
        .collect();

    let count = entries.len() as u64;
    let oldest = entries.first().copied().unwrap_or(now);
    let allowed = count < limit.max_requests;
    RateLimitResult {
        allowed,
        limit: limit.max_requests,
        remaining: limit.max_requests.saturating_sub(count),
        reset_at: ceil_secs(oldest + window),
        retry_after: (!allowed).then(|| ceil_secs(oldest + window - now).max(1)),
    }
}

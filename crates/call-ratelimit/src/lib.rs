//! Per-instance polling rate limiter.
//!
//! One [`RateLimiter`] instance guards every `GET /ops/{requestId}` and
//! `GET /ops/{requestId}/chunks` poll: both share the same `lastPollAt`
//! stamp per requestId, so hammering the chunk endpoint doesn't bypass the
//! status endpoint's budget and vice versa.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Returned when a poll arrives before the minimum interval has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("polled again within {0}ms of the last poll")]
pub struct Throttled(pub u64);

/// A monotonic, per-requestId minimum poll interval.
pub struct RateLimiter {
    interval_ms: u64,
    last_poll_ms: RwLock<HashMap<Uuid, i64>>,
}

impl RateLimiter {
    /// Construct a limiter enforcing `interval_ms` between polls of the
    /// same requestId.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_poll_ms: RwLock::new(HashMap::new()),
        }
    }

    /// The configured minimum interval.
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Record a poll of `request_id` at `now_ms`. Returns
    /// `Err(Throttled(retry_after_ms))` if the prior poll was within
    /// `interval_ms`; on success, stamps `now_ms` as the new `lastPollAt`.
    pub async fn poll(&self, request_id: Uuid, now_ms: i64) -> Result<(), Throttled> {
        let mut guard = self.last_poll_ms.write().await;
        if let Some(&last) = guard.get(&request_id) {
            let elapsed = now_ms.saturating_sub(last);
            if elapsed < self.interval_ms as i64 {
                let retry_after_ms = (self.interval_ms as i64 - elapsed).max(0) as u64;
                return Err(Throttled(retry_after_ms.min(self.interval_ms)));
            }
        }
        guard.insert(request_id, now_ms);
        Ok(())
    }

    /// Drop the stamp for `request_id`, e.g. when its instance is reaped.
    pub async fn forget(&self, request_id: Uuid) {
        self.last_poll_ms.write().await.remove(&request_id);
    }
}

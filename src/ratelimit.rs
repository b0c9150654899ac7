//! Fixed-window rate limiting over the fast store.
//!
//! One atomic `INCR` per request against a minute-granular key. If the fast
//! store is unreachable the limiter fails open: blocking all traffic on a
//! cache outage is worse than a bounded over-serve, and the upstream applies
//! its own coarser guard.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::store::{ratelimit_key, FastStore};

/// Rate window length in seconds.
pub const WINDOW_SECS: i64 = 60;

/// Day window length in seconds, for the synchronous daily-cap check.
const DAY_SECS: i64 = 86_400;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// The limit the decision was made against.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Unix second at which the window resets.
    pub reset_at: i64,
}

impl RateDecision {
    /// Seconds from `now` until the window resets (for `Retry-After`).
    pub fn retry_after_secs(&self, now_unix: i64) -> u64 {
        (self.reset_at - now_unix).max(0) as u64
    }
}

/// Per-token fixed-window limiter.
pub struct RateLimiter {
    fast: Arc<dyn FastStore>,
}

impl RateLimiter {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self { fast }
    }

    /// Check and consume one slot in the token's minute window.
    pub async fn check_minute(&self, token_id: Uuid, limit: u32) -> RateDecision {
        let now = Utc::now().timestamp();
        let window = now.div_euclid(WINDOW_SECS);
        let reset_at = (window + 1) * WINDOW_SECS;
        let key = ratelimit_key("shared", &token_id.to_string(), window);

        match self.consume(&key, WINDOW_SECS as u64).await {
            Ok(count) => {
                let allowed = count <= limit as i64;
                let remaining = (limit as i64 - count).max(0) as u32;
                RateDecision {
                    allowed,
                    limit,
                    remaining,
                    reset_at,
                }
            }
            Err(err) => {
                // Fail open on cache outage.
                tracing::warn!(%token_id, error = %err, "rate-limit store unreachable; failing open");
                RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at,
                }
            }
        }
    }

    /// Synchronous daily-cap check in a day-granular window. A cap of zero
    /// means unlimited. Fails open like the minute window.
    pub async fn check_daily(&self, token_id: Uuid, cap: u32) -> RateDecision {
        let now = Utc::now().timestamp();
        let window = now.div_euclid(DAY_SECS);
        let reset_at = (window + 1) * DAY_SECS;

        if cap == 0 {
            return RateDecision {
                allowed: true,
                limit: 0,
                remaining: u32::MAX,
                reset_at,
            };
        }

        let key = ratelimit_key("shared-day", &token_id.to_string(), window);
        match self.consume(&key, DAY_SECS as u64).await {
            Ok(count) => RateDecision {
                allowed: count <= cap as i64,
                limit: cap,
                remaining: (cap as i64 - count).max(0) as u32,
                reset_at,
            },
            Err(err) => {
                tracing::warn!(%token_id, error = %err, "daily-cap store unreachable; failing open");
                RateDecision {
                    allowed: true,
                    limit: cap,
                    remaining: cap,
                    reset_at,
                }
            }
        }
    }

    async fn consume(&self, key: &str, ttl: u64) -> crate::store::StoreResult<i64> {
        let count = self.fast.incr(key).await?;
        if count == 1 {
            // First hit in the window owns the TTL.
            self.fast.expire(key, ttl).await?;
        }
        Ok(count)
    }
}

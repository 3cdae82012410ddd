//! Fixed-window request counting per (endpoint, principal).
//!
//! The principal is the caller's DID when one resolves, else the client
//! address, else the literal `anonymous`. State is process-local and
//! rebuildable; a restart simply opens fresh windows, which is acceptable
//! for a limiter.

use std::collections::HashMap;

/// Per-endpoint window configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub period_ms: i64,
}

impl RateLimitPolicy {
    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            period_ms: 60_000,
        }
    }
}

/// Endpoints without an explicit figure get this.
pub const DEFAULT_POLICY: RateLimitPolicy = RateLimitPolicy::per_minute(60);

/// Buckets are pruned once the map grows past this.
const PRUNE_THRESHOLD: usize = 1024;

struct Bucket {
    count: u32,
    reset_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_at: i64,
    },
    Rejected {
        limit: u32,
        retry_after_secs: u64,
        reset_at: i64,
    },
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: HashMap<(String, String), Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against the (endpoint, principal) bucket.
    pub fn check(
        &mut self,
        endpoint: &str,
        principal: &str,
        policy: RateLimitPolicy,
        now: i64,
    ) -> Decision {
        if self.buckets.len() >= PRUNE_THRESHOLD {
            self.buckets.retain(|_, bucket| bucket.reset_at > now);
        }

        let key = (endpoint.to_string(), principal.to_string());
        let bucket = self.buckets.entry(key).or_insert(Bucket {
            count: 0,
            reset_at: now + policy.period_ms,
        });

        if now >= bucket.reset_at {
            bucket.count = 1;
            bucket.reset_at = now + policy.period_ms;
            return Decision::Allowed {
                limit: policy.limit,
                remaining: policy.limit.saturating_sub(1),
                reset_at: bucket.reset_at,
            };
        }

        if bucket.count < policy.limit {
            bucket.count += 1;
            return Decision::Allowed {
                limit: policy.limit,
                remaining: policy.limit - bucket.count,
                reset_at: bucket.reset_at,
            };
        }

        let retry_after_secs = ((bucket.reset_at - now) as u64).div_ceil(1000).max(1);
        Decision::Rejected {
            limit: policy.limit,
            retry_after_secs,
            reset_at: bucket.reset_at,
        }
    }
}

//! Sliding-window quota counters per (endpoint, principal).
//!
//! Counters live in the shared cache as atomic increments with a TTL;
//! when no cache is configured a per-process fallback keeps the same
//! window semantics so a single-instance deployment still enforces
//! quotas.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::Result;

/// Outcome of a quota check, exposed to clients as
/// `X-RateLimit-Limit` / `X-RateLimit-Remaining` / `X-RateLimit-Reset`.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) at which the current window expires.
    pub reset: u64,
}

impl QuotaDecision {
    pub fn retry_after(&self, now_secs: u64) -> u64 {
        self.reset.saturating_sub(now_secs).max(1)
    }
}

static LOCAL_WINDOWS: Lazy<Mutex<HashMap<String, (u64, u64)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Clone)]
pub struct RateLimiter {
    redis: Option<redis::aio::ConnectionManager>,
}

impl RateLimiter {
    pub fn new(redis: Option<redis::aio::ConnectionManager>) -> Self {
        Self { redis }
    }

    /// Record `cost` operations against the `(scope, principal)` window
    /// and decide whether the quota still holds. The counter is bumped
    /// even on the rejected call so an abusive client keeps paying.
    pub async fn check(
        &self,
        scope: &str,
        principal: &str,
        limit: u32,
        window_secs: u64,
        cost: u32,
    ) -> Result<QuotaDecision> {
        let now = chrono::Utc::now().timestamp() as u64;
        let window_start = now - (now % window_secs.max(1));
        let reset = window_start + window_secs;
        let key = format!("rl:{}:{}:{}", scope, principal, window_start);

        let count = match &self.redis {
            Some(manager) => {
                let mut conn = manager.clone();
                let count: u64 = redis::cmd("INCRBY")
                    .arg(&key)
                    .arg(cost as u64)
                    .query_async(&mut conn)
                    .await?;
                // TTL covers the remainder of the window plus slack for
                // clock skew between instances.
                let _: () = redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(window_secs + 1)
                    .query_async(&mut conn)
                    .await?;
                count
            }
            None => {
                let mut windows = LOCAL_WINDOWS.lock().await;
                windows.retain(|_, (_, expiry)| *expiry > now);
                let entry = windows.entry(key).or_insert((0, reset));
                entry.0 += cost as u64;
                entry.0
            }
        };

        Ok(QuotaDecision {
            allowed: count <= limit as u64,
            limit,
            remaining: (limit as u64).saturating_sub(count) as u32,
            reset,
        })
    }

    /// Current counter value without incrementing (failed-login checks).
    pub async fn peek(&self, key: &str) -> Result<u64> {
        match &self.redis {
            Some(manager) => {
                let mut conn = manager.clone();
                let count: Option<u64> =
                    redis::cmd("GET").arg(key).query_async(&mut conn).await?;
                Ok(count.unwrap_or(0))
            }
            None => {
                let now = chrono::Utc::now().timestamp() as u64;
                let windows = LOCAL_WINDOWS.lock().await;
                Ok(windows
                    .get(key)
                    .filter(|(_, expiry)| *expiry > now)
                    .map(|(count, _)| *count)
                    .unwrap_or(0))
            }
        }
    }

    /// Atomic increment with TTL on an arbitrary key (failed logins).
    pub async fn bump(&self, key: &str, ttl_secs: u64) -> Result<u64> {
        match &self.redis {
            Some(manager) => {
                let mut conn = manager.clone();
                let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
                let _: () = redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs)
                    .query_async(&mut conn)
                    .await?;
                Ok(count)
            }
            None => {
                let now = chrono::Utc::now().timestamp() as u64;
                let mut windows = LOCAL_WINDOWS.lock().await;
                let entry = windows
                    .entry(key.to_string())
                    .or_insert((0, now + ttl_secs));
                if entry.1 <= now {
                    *entry = (0, now + ttl_secs);
                }
                entry.0 += 1;
                Ok(entry.0)
            }
        }
    }

    /// Drop a counter (successful login clears the failure streak).
    pub async fn clear(&self, key: &str) -> Result<()> {
        match &self.redis {
            Some(manager) => {
                let mut conn = manager.clone();
                let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            }
            None => {
                LOCAL_WINDOWS.lock().await.remove(key);
            }
        }
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        match &self.redis {
            Some(manager) => {
                let mut conn = manager.clone();
                redis::cmd("PING")
                    .query_async::<_, String>(&mut conn)
                    .await
                    .is_ok()
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quota_allows_then_rejects() {
        let limiter = RateLimiter::new(None);
        let scope = "test_quota_allows";
        for i in 0..3 {
            let decision = limiter.check(scope, "alice", 3, 60, 1).await.unwrap();
            assert!(decision.allowed, "call {} should pass", i);
        }
        let decision = limiter.check(scope, "alice", 3, 60, 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset > 0);
    }

    #[tokio::test]
    async fn quota_is_per_principal() {
        let limiter = RateLimiter::new(None);
        let scope = "test_quota_principal";
        for _ in 0..2 {
            limiter.check(scope, "a", 2, 60, 1).await.unwrap();
        }
        assert!(!limiter.check(scope, "a", 2, 60, 1).await.unwrap().allowed);
        assert!(limiter.check(scope, "b", 2, 60, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn batched_cost_counts_events() {
        let limiter = RateLimiter::new(None);
        let scope = "test_quota_cost";
        let decision = limiter.check(scope, "a", 10, 60, 8).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        let decision = limiter.check(scope, "a", 10, 60, 5).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn bump_and_clear_counters() {
        let limiter = RateLimiter::new(None);
        let key = "failed_login:test_bump";
        assert_eq!(limiter.bump(key, 60).await.unwrap(), 1);
        assert_eq!(limiter.bump(key, 60).await.unwrap(), 2);
        assert_eq!(limiter.peek(key).await.unwrap(), 2);
        limiter.clear(key).await.unwrap();
        assert_eq!(limiter.peek(key).await.unwrap(), 0);
    }
}

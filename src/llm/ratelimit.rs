//! Per-user sliding-window rate limiting backed by the KV store.
//!
//! The window lives in a sorted set of request timestamps. Each acquire
//! trims entries older than the window, counts what remains, inserts the
//! new timestamp, and refreshes the key TTL. Authenticated users get a
//! per-user key; anonymous callers share one stricter key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::kv::KvStore;

/// Default requests per window for authenticated users.
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 30;
/// Default requests per window for the shared anonymous key.
pub const ANONYMOUS_RATE_LIMIT_REQUESTS: u32 = 10;
/// Default window size in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW: u64 = 60;

/// Sliding-window rate limiter for one principal.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    key: String,
    user_id: String,
    max_requests: u32,
    window_secs: u64,
}

impl RateLimiter {
    /// Build a limiter for `user_id`; `None` maps to the shared anonymous key.
    pub fn new(
        kv: Arc<dyn KvStore>,
        user_id: Option<&str>,
        max_requests: Option<u32>,
        window_secs: Option<u64>,
    ) -> Self {
        let (key, user_id, default_max) = match user_id {
            Some(id) if !id.is_empty() && id != "anonymous" => (
                format!("ratelimit:user:{id}:nvidia_api"),
                id.to_string(),
                DEFAULT_RATE_LIMIT_REQUESTS,
            ),
            _ => (
                "ratelimit:anonymous:nvidia_api".to_string(),
                "anonymous".to_string(),
                ANONYMOUS_RATE_LIMIT_REQUESTS,
            ),
        };
        Self {
            kv,
            key,
            user_id,
            max_requests: max_requests.unwrap_or(default_max),
            window_secs: window_secs.unwrap_or(DEFAULT_RATE_LIMIT_WINDOW),
        }
    }

    fn now_secs() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    /// Try to take a slot. Returns false when the window is full.
    pub async fn acquire(&self) -> Result<bool> {
        let now = Self::now_secs();
        let window_start = now - self.window_secs as f64;

        self.kv.zremrangebyscore(&self.key, 0.0, window_start).await?;
        let current = self.kv.zcard(&self.key).await?;

        if current >= self.max_requests as u64 {
            debug!(
                key = %self.key,
                current,
                limit = self.max_requests,
                "rate limit window full"
            );
            return Ok(false);
        }

        // Member must be unique per request; the score carries the time.
        let member = format!("{now}-{}", Uuid::new_v4());
        self.kv.zadd(&self.key, &member, now).await?;
        self.kv.expire(&self.key, self.window_secs).await?;
        Ok(true)
    }

    /// Remaining slots and seconds until the oldest entry ages out.
    pub async fn get_remaining(&self) -> Result<(u32, f64)> {
        let now = Self::now_secs();
        let window_start = now - self.window_secs as f64;

        self.kv.zremrangebyscore(&self.key, 0.0, window_start).await?;
        let current = self.kv.zcard(&self.key).await?;
        let remaining = self.max_requests.saturating_sub(current as u32);

        let reset_secs = match self.kv.zmin_score(&self.key).await? {
            Some(oldest) => (oldest + self.window_secs as f64 - now).max(0.0),
            None => 0.0,
        };

        Ok((remaining, reset_secs))
    }

    /// Wait for a slot, polling until `timeout`. Errors with a retry-after
    /// hint when the wait is exhausted.
    pub async fn wait_for_slot(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.acquire().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let (_, reset_secs) = self.get_remaining().await?;
                return Err(Error::RateLimited {
                    user_id: self.user_id.clone(),
                    retry_after_secs: reset_secs.max(1.0),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryKvStore::new()),
            Some("user-1"),
            Some(max),
            Some(60),
        )
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let limiter = limiter(3);
        for _ in 0..3 {
            assert!(limiter.acquire().await.unwrap());
        }
        assert!(!limiter.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = limiter(5);
        let (remaining, _) = limiter.get_remaining().await.unwrap();
        assert_eq!(remaining, 5);

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let (remaining, reset) = limiter.get_remaining().await.unwrap();
        assert_eq!(remaining, 3);
        assert!(reset > 0.0 && reset <= 60.0);
    }

    #[tokio::test]
    async fn test_anonymous_shares_stricter_key() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let a = RateLimiter::new(kv.clone(), None, None, Some(60));
        let b = RateLimiter::new(kv, Some("anonymous"), None, Some(60));
        assert_eq!(a.max_requests(), ANONYMOUS_RATE_LIMIT_REQUESTS);

        // Both limiters drain the same shared window.
        for _ in 0..ANONYMOUS_RATE_LIMIT_REQUESTS {
            assert!(a.acquire().await.unwrap());
        }
        assert!(!b.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_slot_times_out_with_hint() {
        let limiter = limiter(1);
        assert!(limiter.acquire().await.unwrap());

        let err = limiter
            .wait_for_slot(Duration::from_millis(10))
            .await
            .unwrap_err();
        match err {
            Error::RateLimited {
                retry_after_secs, ..
            } => assert!(retry_after_secs > 0.0),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}

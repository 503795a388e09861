use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::time::sleep;

use crate::error::RateLimitError;

/// Lua body for the shared token-bucket acquire. Any reimplementation that
/// shares a bucket with other-language workers must keep this script
/// byte-identical in semantics: monotonic refill in wall-clock ms, no
/// overshoot past `burst`, and disabled (always-allow) when rate or burst
/// is non-positive.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

if rate <= 0 or burst <= 0 then
    return 1
end

local values = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(values[1])
local ts = tonumber(values[2])
if tokens == nil then tokens = burst end
if ts == nil then ts = now_ms end

local delta = now_ms - ts
if delta > 0 then
    local refill = (delta * rate) / 1000.0
    tokens = math.min(burst, tokens + refill)
    ts = now_ms
end

local ttl_ms = math.ceil((burst / rate) * 1000 * 2)

if tokens < requested then
    redis.call('HMSET', key, 'tokens', tokens, 'ts', ts)
    redis.call('PEXPIRE', key, ttl_ms)
    return 0
end

tokens = tokens - requested
redis.call('HMSET', key, 'tokens', tokens, 'ts', ts)
redis.call('PEXPIRE', key, ttl_ms)
return 1
"#;

#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn acquire(&self, n: u32) -> Result<bool, RateLimitError>;

    /// Blocks (with capped exponential backoff between probes) until a
    /// token is available or `timeout` elapses.
    async fn wait_for_token(&self, timeout: Duration) -> Result<(), RateLimitError> {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;
        loop {
            if self.acquire(1).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RateLimitError::Timeout);
            }
            let backoff = Duration::from_secs_f64((0.1 * 1.5f64.powi(attempt as i32)).min(1.0));
            sleep(backoff).await;
            attempt += 1;
        }
    }
}

/// The shared, cross-process, cross-language limiter. Keyed at
/// `<namespace>:ratelimit:global`; every worker sharing that key observes
/// the same bucket regardless of implementation language.
pub struct GlobalRateLimiter {
    manager: ConnectionManager,
    script: Script,
    key: String,
    rate: f64,
    burst: f64,
}

impl GlobalRateLimiter {
    pub fn new(manager: ConnectionManager, namespace: &str, rate: f64, burst: f64) -> Self {
        Self {
            manager,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            key: format!("{namespace}:ratelimit:global"),
            rate,
            burst,
        }
    }

}

#[async_trait]
impl RateLimiterEngine for GlobalRateLimiter {
    async fn acquire(&self, n: u32) -> Result<bool, RateLimitError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut conn = self.manager.clone();
        let allowed: i64 = self
            .script
            .key(&self.key)
            .arg(now_ms)
            .arg(self.rate)
            .arg(self.burst)
            .arg(n)
            .invoke_async(&mut conn)
            .await?;
        Ok(allowed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// In-process stand-in for the Redis-backed limiter, used where a real
    /// Redis server isn't assumed available. Implements the same acquire
    /// semantics as the Lua script above.
    pub struct InMemoryRateLimiter {
        state: Arc<Mutex<(f64, Instant)>>,
        rate: f64,
        burst: f64,
    }

    impl InMemoryRateLimiter {
        pub fn new(rate: f64, burst: f64) -> Self {
            Self {
                state: Arc::new(Mutex::new((burst, Instant::now()))),
                rate,
                burst,
            }
        }
    }

    #[async_trait]
    impl RateLimiterEngine for InMemoryRateLimiter {
        async fn acquire(&self, n: u32) -> Result<bool, RateLimitError> {
            if self.rate <= 0.0 || self.burst <= 0.0 {
                return Ok(true);
            }
            let mut guard = self.state.lock().await;
            let (mut tokens, ts) = *guard;
            let elapsed = ts.elapsed().as_secs_f64();
            tokens = (tokens + elapsed * self.rate).min(self.burst);
            let now = Instant::now();
            if tokens < n as f64 {
                *guard = (tokens, now);
                return Ok(false);
            }
            tokens -= n as f64;
            *guard = (tokens, now);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn at_most_burst_acquisitions_succeed_concurrently() {
        let limiter = Arc::new(InMemoryRateLimiter::new(0.001, 5.0));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire(1).await.unwrap() }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn refill_is_bounded_by_burst() {
        let limiter = InMemoryRateLimiter::new(1000.0, 3.0);
        for _ in 0..3 {
            assert!(limiter.acquire(1).await.unwrap());
        }
        assert!(!limiter.acquire(1).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.acquire(1).await.unwrap());
    }
}

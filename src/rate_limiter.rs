use async_trait::async_trait;
use redis::Script;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ApiError;
use crate::key_generator::{ClientIpSource, KeyStrategy};
use crate::rate_limit_config::{FailurePolicy, RateLimitRule};
use crate::redis::RedisClient;
use crate::response::Decision;

/// Counter value right after an increment, plus how long its window has left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub ttl: Duration,
}

/// Backing store for fixed-window counters.
///
/// `increment` must be atomic with respect to concurrent calls for the same
/// key, and must only start the expiry when the counter goes from 0 to 1 so
/// that steady traffic cannot hold a window open.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, ApiError>;
}

// INCR and first-hit PEXPIRE run inside one script so no other client can
// interleave. A key found without a TTL is re-armed rather than left immortal.
static INCREMENT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        local ttl = redis.call('PTTL', KEYS[1])
        if ttl < 0 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
            ttl = tonumber(ARGV[1])
        end
        return {count, ttl}
        ",
    )
});

#[derive(Clone)]
pub struct RedisCounterStore {
    client: RedisClient,
}

impl RedisCounterStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, ApiError> {
        let (count, ttl_ms): (i64, i64) = self
            .client
            .eval_script(&INCREMENT_SCRIPT, &[key], &[window.as_millis().to_string()])
            .await?;

        Ok(WindowCount {
            count: count.max(0) as u64,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }
}

/// Process-local counters, used in tests and single-instance setups.
/// Expiry follows the tokio clock so paused-time tests can advance it.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, ApiError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;

        counters.retain(|_, (_, expires_at)| *expires_at > now);

        let entry = counters
            .entry(key.to_string())
            .or_insert_with(|| (0, now + window));
        entry.0 += 1;

        Ok(WindowCount {
            count: entry.0,
            ttl: entry.1.saturating_duration_since(now),
        })
    }
}

/// A fixed-window request gate for one route family.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    rule: RateLimitRule,
    strategy: KeyStrategy,
    failure_policy: FailurePolicy,
    ip_source: ClientIpSource,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        rule: RateLimitRule,
        strategy: KeyStrategy,
        failure_policy: FailurePolicy,
    ) -> Result<Self, ApiError> {
        rule.validate()?;
        Ok(Self {
            store,
            rule,
            strategy,
            failure_policy,
            ip_source: ClientIpSource::default(),
        })
    }

    pub fn with_ip_source(mut self, ip_source: ClientIpSource) -> Self {
        self.ip_source = ip_source;
        self
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    pub fn strategy(&self) -> &KeyStrategy {
        &self.strategy
    }

    pub fn ip_source(&self) -> ClientIpSource {
        self.ip_source
    }

    /// Count one request for `identity` and decide whether it may proceed.
    pub async fn admit(&self, identity: &str) -> Result<Decision, ApiError> {
        let key = self.rule.counter_key(identity);

        let window = match self.store.increment(&key, self.rule.window).await {
            Ok(window) => window,
            Err(err) => {
                return match self.failure_policy {
                    FailurePolicy::Closed => Err(ApiError::LimiterUnavailable(err.to_string())),
                    FailurePolicy::Open => {
                        warn!(
                            key = %key,
                            error = %err,
                            "rate limiter store unavailable, admitting request"
                        );
                        Ok(Decision::allowed(
                            self.rule.max,
                            self.rule.max,
                            self.rule.window.as_secs(),
                        ))
                    }
                };
            }
        };

        let reset_in = ceil_secs(window.ttl);
        if window.count > self.rule.max {
            Ok(Decision::denied(self.rule.max, reset_in))
        } else {
            Ok(Decision::allowed(
                self.rule.max,
                self.rule.max.saturating_sub(window.count),
                reset_in,
            ))
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<WindowCount, ApiError> {
            Err(ApiError::RedisConnectionError("connection refused".into()))
        }
    }

    fn limiter(max: u64, window: Duration) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitRule::new(max, window, "test"),
            KeyStrategy::IpAddress,
            FailurePolicy::Closed,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_max_then_rejects() {
        let limiter = limiter(3, Duration::from_secs(60));

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.admit("1.2.3.4").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.retry_after, None);
        }

        let rejected = limiter.admit("1.2.3.4").await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identities_are_counted_separately() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.admit("1.1.1.1").await.unwrap().allowed);
        assert!(limiter.admit("2.2.2.2").await.unwrap().allowed);
        assert!(!limiter.admit("1.1.1.1").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_does_not_extend_window() {
        let limiter = limiter(100, Duration::from_secs(10));

        let first = limiter.admit("ip").await.unwrap();
        assert_eq!(first.reset_in, 10);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = limiter.admit("ip").await.unwrap();
        assert_eq!(second.reset_in, 6);

        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = limiter.admit("ip").await.unwrap();
        assert_eq!(fresh.remaining, 99);
        assert_eq!(fresh.reset_in, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_never_exceed_max() {
        let limiter = Arc::new(limiter(10, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.admit("same").await.unwrap() }));
        }

        let mut admitted = 0;
        for handle in handles {
            let decision = handle.await.unwrap();
            if decision.allowed {
                admitted += 1;
            } else {
                assert_eq!(decision.remaining, 0);
                assert!(decision.retry_after.unwrap() > 0);
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_fail_closed_when_store_unreachable() {
        let limiter = RateLimiter::new(
            Arc::new(UnreachableStore),
            RateLimitRule::default(),
            KeyStrategy::IpAddress,
            FailurePolicy::Closed,
        )
        .unwrap();

        let err = limiter.admit("ip").await.unwrap_err();
        assert!(matches!(err, ApiError::LimiterUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fail_open_admits_when_store_unreachable() {
        let limiter = RateLimiter::new(
            Arc::new(UnreachableStore),
            RateLimitRule::default(),
            KeyStrategy::IpAddress,
            FailurePolicy::Open,
        )
        .unwrap();

        let decision = limiter.admit("ip").await.unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let result = RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitRule::new(0, Duration::from_secs(60), "x"),
            KeyStrategy::IpAddress,
            FailurePolicy::Closed,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(0)), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
    }
}

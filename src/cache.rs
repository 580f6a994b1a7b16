//! Read-through response cache.
//!
//! Entries are JSON strings with a time-to-live. Nothing is invalidated on
//! write; readers may see data up to one TTL old.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::redis::RedisClient;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ApiError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), ApiError>;
}

#[async_trait]
impl CacheStore for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        RedisClient::get(self, key).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ApiError> {
        RedisClient::set_with_expiry(self, key, value, ttl).await
    }
}

/// Process-local cache on the tokio clock.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }
}

#[derive(Clone)]
pub struct ReadThroughCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `key`, or runs `compute` and caches its
    /// result for `ttl`.
    ///
    /// A broken or unreachable cache never fails the call: lookup and decode
    /// errors count as a miss, write errors are logged. Errors from `compute`
    /// are returned and nothing is cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, ApiError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    return Ok(value);
                }
                Err(e) => warn!(key, error = %e, "discarding undecodable cache entry"),
            },
            Ok(None) => debug!(key, "cache miss"),
            Err(e) => warn!(key, error = %e, "cache lookup failed"),
        }

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.store.set_with_expiry(key, &raw, ttl).await {
                    warn!(key, error = %e, "cache write failed");
                }
            }
            Err(e) => warn!(key, error = %e, "cache serialization failed"),
        }

        Ok(value)
    }

    /// [`Self::get_or_compute`] with the configured default TTL.
    pub async fn get_or_compute_default<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<T, ApiError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.get_or_compute(key, self.ttl, compute).await
    }
}

pub mod keys {
    pub const COUPONS: &str = "coupons";
    pub const MERCHANTS: &str = "merchants";
    pub const CATEGORIES: &str = "categories";
    pub const TAGS: &str = "tags";
    pub const REGIONS: &str = "regions";

    /// Key for a search, independent of query parameter order.
    pub fn search(raw_query: &str) -> String {
        let mut pairs: Vec<&str> = raw_query.split('&').filter(|pair| !pair.is_empty()).collect();
        if pairs.is_empty() {
            return COUPONS.to_string();
        }
        pairs.sort_unstable();
        format!("{}:{}", COUPONS, pairs.join("&"))
    }

    pub fn coupon(id: i64) -> String {
        format!("coupon:id:{}", id)
    }

    /// Key for a per-domain lookup from the Syrup compatibility API.
    pub fn syrup_coupons(domain: Option<&str>, limit: i64, offset: i64) -> String {
        format!("syrup:coupons:{}:{}:{}", domain.unwrap_or_default(), limit, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingCache;

    #[async_trait]
    impl CacheStore for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, ApiError> {
            Err(ApiError::RedisConnectionError("down".into()))
        }

        async fn set_with_expiry(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<(), ApiError> {
            Err(ApiError::RedisConnectionError("down".into()))
        }
    }

    fn cache() -> (ReadThroughCache, InMemoryCache) {
        let store = InMemoryCache::new();
        (
            ReadThroughCache::new(Arc::new(store.clone()), DEFAULT_TTL),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_read_is_served_from_cache() {
        let (cache, _) = cache();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..2 {
            let value: Vec<String> = cache
                .get_or_compute("tags", DEFAULT_TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["online".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(value, vec!["online"]);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let (cache, _) = cache();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute =
            move || async move { Ok::<_, ApiError>(calls.fetch_add(1, Ordering::SeqCst)) };

        let ttl = Duration::from_secs(300);
        assert_eq!(cache.get_or_compute("k", ttl, compute).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get_or_compute("k", ttl, compute).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get_or_compute("k", ttl, compute).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let (cache, store) = cache();
        store
            .set_with_expiry("merchants", "{not json", DEFAULT_TTL)
            .await
            .unwrap();

        let value: Vec<u32> = cache
            .get_or_compute("merchants", DEFAULT_TTL, || async { Ok(vec![1, 2]) })
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2]);
        assert_eq!(store.get("merchants").await.unwrap().as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn test_unreachable_cache_still_returns_value() {
        let cache = ReadThroughCache::new(Arc::new(FailingCache), DEFAULT_TTL);
        let value: String = cache
            .get_or_compute("regions", DEFAULT_TTL, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test]
    async fn test_compute_errors_are_not_cached() {
        let (cache, store) = cache();
        let result: Result<String, ApiError> = cache
            .get_or_compute("coupon:id:9", DEFAULT_TTL, || async {
                Err(ApiError::NotFound("coupon 9".into()))
            })
            .await;

        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert_eq!(store.get("coupon:id:9").await.unwrap(), None);
    }

    #[test]
    fn test_search_key_is_order_independent() {
        assert_eq!(keys::search(""), "coupons");
        assert_eq!(keys::search("&&"), "coupons");
        assert_eq!(
            keys::search("sort_by=newest&q=pizza"),
            keys::search("q=pizza&&sort_by=newest")
        );
        assert_eq!(keys::search("q=pizza&limit=5"), "coupons:limit=5&q=pizza");
    }

    #[test]
    fn test_lookup_keys() {
        assert_eq!(keys::coupon(42), "coupon:id:42");
        assert_eq!(
            keys::syrup_coupons(Some("acme.com"), 20, 0),
            "syrup:coupons:acme.com:20:0"
        );
        assert_eq!(keys::syrup_coupons(None, 5, 10), "syrup:coupons::5:10");
    }
}

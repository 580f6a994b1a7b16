use async_trait::async_trait;
use redis::Script;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ApiError;
use crate::models::VoteEnvelope;
use crate::redis::RedisClient;

pub const DEFAULT_QUEUE_KEY: &str = "vote_queue";

/// FIFO of pending votes with at-least-once hand-off.
///
/// Consumers `peek` a prefix, persist it, and only then `ack` the same number
/// of entries. A consumer that dies between the two leaves the entries in
/// place for the next drain.
///
/// `ack` trims by position, so peek-to-ack must be serialized across
/// consumers: hold the drain lease around it.
#[async_trait]
pub trait VoteQueue: Send + Sync {
    /// Appends a vote and returns the new queue length.
    async fn push(&self, vote: &VoteEnvelope) -> Result<u64, ApiError>;

    /// Returns up to `max` raw entries from the head without removing them.
    async fn peek(&self, max: usize) -> Result<Vec<String>, ApiError>;

    /// Removes the first `count` entries.
    async fn ack(&self, count: usize) -> Result<(), ApiError>;

    async fn len(&self) -> Result<u64, ApiError>;

    async fn ping(&self) -> Result<(), ApiError>;

    /// Takes the drain lease for `owner` unless another owner holds an
    /// unexpired one. Returns whether `owner` now holds it.
    async fn acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool, ApiError>;

    /// Drops the lease if `owner` still holds it.
    async fn release_lease(&self, owner: &str) -> Result<(), ApiError>;
}

// Returns -1 when the list already holds ARGV[2] entries (0 = unbounded).
static BOUNDED_PUSH_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local max = tonumber(ARGV[2])
        if max > 0 and redis.call('LLEN', KEYS[1]) >= max then
            return -1
        end
        return redis.call('RPUSH', KEYS[1], ARGV[1])
        ",
    )
});

// Grants the lease when it is free or already held by ARGV[1]; 1 on success.
static ACQUIRE_LEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local holder = redis.call('GET', KEYS[1])
        if holder == false then
            redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
            return 1
        end
        if holder == ARGV[1] then
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
            return 1
        end
        return 0
        ",
    )
});

// Compare-and-delete so an expired holder cannot drop its successor's lease.
static RELEASE_LEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

#[derive(Clone)]
pub struct RedisVoteQueue {
    client: RedisClient,
    key: String,
    max_len: u64,
}

impl RedisVoteQueue {
    pub fn new(client: RedisClient, max_len: u64) -> Self {
        Self::with_key(client, DEFAULT_QUEUE_KEY, max_len)
    }

    pub fn with_key(client: RedisClient, key: impl Into<String>, max_len: u64) -> Self {
        Self {
            client,
            key: key.into(),
            max_len,
        }
    }

    fn lease_key(&self) -> String {
        format!("{}:lock", self.key)
    }
}

#[async_trait]
impl VoteQueue for RedisVoteQueue {
    async fn push(&self, vote: &VoteEnvelope) -> Result<u64, ApiError> {
        let payload = serde_json::to_string(vote)?;
        let len: i64 = self
            .client
            .eval_script(
                &BOUNDED_PUSH_SCRIPT,
                &[self.key.as_str()],
                &[payload, self.max_len.to_string()],
            )
            .await?;

        if len < 0 {
            return Err(ApiError::QueueFull);
        }
        Ok(len as u64)
    }

    async fn peek(&self, max: usize) -> Result<Vec<String>, ApiError> {
        self.client.list_head(&self.key, max).await
    }

    async fn ack(&self, count: usize) -> Result<(), ApiError> {
        if count == 0 {
            return Ok(());
        }
        self.client.list_drop_head(&self.key, count).await
    }

    async fn len(&self) -> Result<u64, ApiError> {
        self.client.list_len(&self.key).await
    }

    async fn ping(&self) -> Result<(), ApiError> {
        self.client.ping().await.map(|_| ())
    }

    async fn acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool, ApiError> {
        let lease_key = self.lease_key();
        let ttl_ms = ttl.as_millis().max(1).to_string();
        let granted: i64 = self
            .client
            .eval_script(
                &ACQUIRE_LEASE_SCRIPT,
                &[lease_key.as_str()],
                &[owner.to_string(), ttl_ms],
            )
            .await?;
        Ok(granted == 1)
    }

    async fn release_lease(&self, owner: &str) -> Result<(), ApiError> {
        let lease_key = self.lease_key();
        let _: i64 = self
            .client
            .eval_script(
                &RELEASE_LEASE_SCRIPT,
                &[lease_key.as_str()],
                &[owner.to_string()],
            )
            .await?;
        Ok(())
    }
}

/// Process-local queue with the same semantics as [`RedisVoteQueue`].
#[derive(Clone, Default)]
pub struct InMemoryVoteQueue {
    entries: Arc<Mutex<VecDeque<String>>>,
    lease: Arc<Mutex<Option<(String, Instant)>>>,
    max_len: u64,
}

impl InMemoryVoteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(max_len: u64) -> Self {
        Self {
            max_len,
            ..Self::default()
        }
    }

    /// Appends an arbitrary payload, bypassing serialization.
    pub async fn push_raw(&self, payload: impl Into<String>) {
        self.entries.lock().await.push_back(payload.into());
    }
}

#[async_trait]
impl VoteQueue for InMemoryVoteQueue {
    async fn push(&self, vote: &VoteEnvelope) -> Result<u64, ApiError> {
        let payload = serde_json::to_string(vote)?;
        let mut entries = self.entries.lock().await;
        if self.max_len > 0 && entries.len() as u64 >= self.max_len {
            return Err(ApiError::QueueFull);
        }
        entries.push_back(payload);
        Ok(entries.len() as u64)
    }

    async fn peek(&self, max: usize) -> Result<Vec<String>, ApiError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().take(max).cloned().collect())
    }

    async fn ack(&self, count: usize) -> Result<(), ApiError> {
        let mut entries = self.entries.lock().await;
        let count = count.min(entries.len());
        entries.drain(..count);
        Ok(())
    }

    async fn len(&self) -> Result<u64, ApiError> {
        Ok(self.entries.lock().await.len() as u64)
    }

    async fn ping(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool, ApiError> {
        let now = Instant::now();
        let mut lease = self.lease.lock().await;
        let held_elsewhere = lease
            .as_ref()
            .is_some_and(|(holder, expires_at)| holder.as_str() != owner && *expires_at > now);
        if held_elsewhere {
            return Ok(false);
        }
        *lease = Some((owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, owner: &str) -> Result<(), ApiError> {
        let mut lease = self.lease.lock().await;
        if lease.as_ref().is_some_and(|(holder, _)| holder.as_str() == owner) {
            *lease = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteDirection;
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn envelope(id: i64) -> VoteEnvelope {
        VoteEnvelope::new(id, VoteDirection::Up, Utc::now())
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let queue = InMemoryVoteQueue::new();
        queue.push(&envelope(1)).await.unwrap();
        queue.push(&envelope(2)).await.unwrap();

        assert_eq!(queue.peek(10).await.unwrap().len(), 2);
        assert_eq!(queue.peek(1).await.unwrap().len(), 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ack_removes_from_head_in_order() {
        let queue = InMemoryVoteQueue::new();
        for id in 1..=3 {
            queue.push(&envelope(id)).await.unwrap();
        }

        queue.ack(2).await.unwrap();

        let remaining = queue.peek(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        let head: VoteEnvelope = serde_json::from_str(&remaining[0]).unwrap();
        assert_eq!(head.coupon_id, 3);
    }

    #[tokio::test]
    async fn test_ack_more_than_len_empties_queue() {
        let queue = InMemoryVoteQueue::new();
        queue.push(&envelope(1)).await.unwrap();
        queue.ack(5).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_when_full() {
        let queue = InMemoryVoteQueue::bounded(2);
        assert_eq!(assert_ok!(queue.push(&envelope(1)).await), 1);
        assert_eq!(assert_ok!(queue.push(&envelope(2)).await), 2);

        let err = assert_err!(queue.push(&envelope(3)).await);
        assert!(matches!(err, ApiError::QueueFull));

        queue.ack(1).await.unwrap();
        assert_ok!(queue.push(&envelope(3)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_admits_one_owner_until_expiry() {
        let queue = InMemoryVoteQueue::new();
        let ttl = Duration::from_secs(30);

        assert!(queue.acquire_lease("a", ttl).await.unwrap());
        assert!(!queue.acquire_lease("b", ttl).await.unwrap());
        // Re-acquiring extends the holder's own lease.
        assert!(queue.acquire_lease("a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(queue.acquire_lease("b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let queue = InMemoryVoteQueue::new();
        let ttl = Duration::from_secs(30);

        assert!(queue.acquire_lease("a", ttl).await.unwrap());
        queue.release_lease("b").await.unwrap();
        assert!(!queue.acquire_lease("b", ttl).await.unwrap());

        queue.release_lease("a").await.unwrap();
        assert!(queue.acquire_lease("b", ttl).await.unwrap());
    }
}

use crate::error::ApiError;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, Script};
use std::time::Duration;

/// Shared handle to the Redis instance holding rate-limit counters, the vote
/// queue and cached responses. Cheap to clone; all clones multiplex over one
/// managed connection that reconnects on its own.
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(redis_url: &str) -> Result<Self, ApiError> {
        let client = Client::open(redis_url).map_err(|e| {
            ApiError::RedisConnectionError(format!("Failed to create Redis client: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            ApiError::RedisConnectionError(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self { connection })
    }

    pub async fn ping(&self) -> Result<String, ApiError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("Ping failed: {}", e)))
    }

    pub async fn eval_script<T>(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<T, ApiError>
    where
        T: FromRedisValue,
    {
        let mut conn = self.connection.clone();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }

        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("Script execution failed: {}", e)))
    }

    pub async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> Result<(), ApiError> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("SET failed: {}", e)))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("GET failed: {}", e)))
    }

    /// Reads `count` elements from the head of a list without removing them.
    pub async fn list_head(&self, key: &str, count: usize) -> Result<Vec<String>, ApiError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("LRANGE failed: {}", e)))
    }

    /// Drops the first `count` elements of a list.
    pub async fn list_drop_head(&self, key: &str, count: usize) -> Result<(), ApiError> {
        let mut conn = self.connection.clone();
        redis::cmd("LTRIM")
            .arg(key)
            .arg(count as i64)
            .arg(-1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("LTRIM failed: {}", e)))
    }

    pub async fn list_len(&self, key: &str) -> Result<u64, ApiError> {
        let mut conn = self.connection.clone();
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::RedisConnectionError(format!("LLEN failed: {}", e)))
    }
}

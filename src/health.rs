use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::{Instant, SystemTime};

use crate::error::ApiError;
use crate::store::CouponStore;
use crate::vote_queue::VoteQueue;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub database: ServiceStatus,
    pub redis: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceStatus {
    fn from_check(result: Result<(), ApiError>, started: Instant) -> Self {
        let response_time_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => Self {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => Self {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: LazyLock<SystemTime> = LazyLock::new(SystemTime::now);

#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn CouponStore>,
    queue: Arc<dyn VoteQueue>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn CouponStore>, queue: Arc<dyn VoteQueue>) -> Self {
        LazyLock::force(&START_TIME);
        Self { store, queue }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now
            .duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let started = Instant::now();
        let database = ServiceStatus::from_check(self.store.ping().await, started);

        let started = Instant::now();
        let redis = ServiceStatus::from_check(self.queue.ping().await, started);

        // The API keeps serving reads from the database without Redis.
        let overall_status = if database.is_healthy() && redis.is_healthy() {
            "ok"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus { database, redis },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCouponStore;
    use crate::vote_queue::InMemoryVoteQueue;

    #[tokio::test]
    async fn test_all_dependencies_healthy() {
        let checker = HealthChecker::new(
            Arc::new(InMemoryCouponStore::new()),
            Arc::new(InMemoryVoteQueue::new()),
        );

        let status = checker.check_health().await;
        assert_eq!(status.status, "ok");
        assert!(status.dependencies.database.is_healthy());
        assert!(status.dependencies.redis.error.is_none());
    }

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus {
            status: "degraded".to_string(),
            timestamp: 1234567890,
            version: "0.1.0".to_string(),
            uptime_seconds: 3600,
            dependencies: DependencyStatus {
                database: ServiceStatus::from_check(Ok(()), Instant::now()),
                redis: ServiceStatus::from_check(
                    Err(ApiError::RedisConnectionError("refused".to_string())),
                    Instant::now(),
                ),
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("degraded"));
        assert!(json.contains("1234567890"));
        assert!(json.contains("refused"));
    }
}

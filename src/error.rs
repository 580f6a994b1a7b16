use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },
    #[error("Rate limiter unavailable: {0}")]
    LimiterUnavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Vote queue is full")]
    QueueFull,
    #[error("Internal server error: {0}")]
    InternalServerError(String),
    #[error("Redis connection error: {0}")]
    RedisConnectionError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::LimiterUnavailable(_)
            | ApiError::QueueFull
            | ApiError::RedisConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalServerError(_)
            | ApiError::DatabaseError(_)
            | ApiError::SerializationError(_)
            | ApiError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Server-side failures whose detail should stay in the logs.
    fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<redis::RedisError> for ApiError {
    fn from(err: redis::RedisError) -> Self {
        ApiError::RedisConnectionError(err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::SerializationError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        let code = err.status_code().as_u16();
        match err {
            ApiError::InvalidRequest(msg) => Self::new("bad_request", msg, code),
            ApiError::RateLimitExceeded { .. } => {
                Self::new("rate_limit_exceeded", "Too many requests", code)
            }
            ApiError::LimiterUnavailable(_) => {
                Self::new("limiter_unavailable", "Rate limiter unavailable", code)
            }
            ApiError::NotFound(msg) => Self::new("not_found", msg, code),
            ApiError::QueueFull => {
                Self::new("queue_full", "Vote queue is full, try again later", code)
            }
            ApiError::RedisConnectionError(_) => {
                Self::new("service_unavailable", "Cache or queue backend unavailable", code)
            }
            ApiError::InternalServerError(_)
            | ApiError::DatabaseError(_)
            | ApiError::SerializationError(_) => {
                Self::new("internal_error", "Internal server error", code)
            }
            ApiError::ConfigurationError(msg) => Self::new("configuration_error", msg, code),
            ApiError::ValidationError(msg) => Self::new("validation_error", msg, code),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse::from_api_error(&self);
        let mut response = (self.status_code(), Json(body)).into_response();

        if let ApiError::RateLimitExceeded { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_database_error_hides_details() {
        let response = ApiError::DatabaseError("password=hunter2 rejected".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response_json(response).await;
        assert_eq!(body["error"], "internal_error");
        assert!(!body.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_rate_limited_response_carries_retry_after() {
        let response = ApiError::RateLimitExceeded { retry_after: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_client_errors_map_to_4xx() {
        assert_eq!(
            ApiError::InvalidRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("coupon 9".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::ValidationError("limit".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_dependency_failures_map_to_503() {
        assert_eq!(
            ApiError::LimiterUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::QueueFull.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Outcome of one rate limiter admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window resets
    pub reset_in: u64,
    pub retry_after: Option<u64>,
}

impl Decision {
    pub fn allowed(limit: u64, remaining: u64, reset_in: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_in,
            retry_after: None,
        }
    }

    /// A rejection always tells the client to wait at least one second.
    pub fn denied(limit: u64, reset_in: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_in,
            retry_after: Some(reset_in.max(1)),
        }
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_in));
        if let Some(retry_after) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }

    /// Like `apply_headers`, but keeps headers an inner limiter already set
    /// when that limiter has less budget left.
    pub fn merge_headers(&self, headers: &mut HeaderMap) {
        let inner_remaining = headers
            .get(&X_RATELIMIT_REMAINING)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        match inner_remaining {
            Some(inner) if inner <= self.remaining => {}
            _ => self.apply_headers(headers),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub message: String,
}

impl SuccessResponse {
    pub fn vote_queued() -> Self {
        Self {
            message: "Vote successfully added to queue".to_string(),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ApiError;

const MIN_WINDOW: Duration = Duration::from_secs(1);
const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Fixed-window rule: at most `max` requests per `window` for each identity
/// under `key_prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub key_prefix: String,
}

/// What the gate does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the request with a limiter-unavailable error.
    #[default]
    Closed,
    /// Let the request through unlimited.
    Open,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max: 100,
            window: Duration::from_secs(60),
            key_prefix: "ratelimit".to_string(),
        }
    }
}

impl RateLimitRule {
    /// Create a new rate limit rule
    pub fn new(max: u64, window: Duration, key_prefix: impl Into<String>) -> Self {
        Self {
            max,
            window,
            key_prefix: key_prefix.into(),
        }
    }

    /// Ceiling on votes from one client across all coupons.
    pub fn vote() -> Self {
        Self::new(10, Duration::from_secs(10 * 60), "votelimit")
    }

    /// One vote per client per coupon.
    pub fn single_vote() -> Self {
        Self::new(1, Duration::from_secs(10 * 60), "singlevotelimit")
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max == 0 {
            return Err(ApiError::ConfigurationError(
                "max requests must be greater than 0".to_string(),
            ));
        }
        if self.window < MIN_WINDOW {
            return Err(ApiError::ConfigurationError(
                "window must be at least 1 second".to_string(),
            ));
        }
        if self.window > MAX_WINDOW {
            return Err(ApiError::ConfigurationError(
                "window must not exceed 24 hours".to_string(),
            ));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(ApiError::ConfigurationError(
                "key prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn counter_key(&self, identity: &str) -> String {
        format!("{}:{}", self.key_prefix, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(RateLimitRule::default().validate().is_ok());
        assert!(RateLimitRule::vote().validate().is_ok());
        assert!(RateLimitRule::single_vote().validate().is_ok());
    }

    #[test]
    fn test_window_bounds() {
        let too_short = RateLimitRule::new(5, Duration::from_millis(500), "x");
        assert!(too_short.validate().is_err());

        let too_long = RateLimitRule::new(5, Duration::from_secs(25 * 60 * 60), "x");
        assert!(too_long.validate().is_err());

        let zero = RateLimitRule::new(0, Duration::from_secs(60), "x");
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_rule_from_json_with_human_window() {
        let rule: RateLimitRule = serde_json::from_str(
            r#"{"max": 1, "window": "10m", "key_prefix": "singlevotelimit"}"#,
        )
        .unwrap();
        assert_eq!(rule, RateLimitRule::single_vote());
    }

    #[test]
    fn test_counter_key() {
        let rule = RateLimitRule::single_vote();
        assert_eq!(rule.counter_key("10.0.0.1:7"), "singlevotelimit:10.0.0.1:7");
    }
}

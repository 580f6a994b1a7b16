use crate::error::ApiError;

/// Validates configuration values for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ApiError> {
        if url.is_empty() {
            return Err(ApiError::ConfigurationError(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ApiError::ConfigurationError(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a Postgres URL
    pub fn validate_database_url(url: &str) -> Result<(), ApiError> {
        if url.is_empty() {
            return Err(ApiError::ConfigurationError(
                "Database URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
            return Err(ApiError::ConfigurationError(
                "Database URL must start with 'postgres://' or 'postgresql://'".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_batch_size(name: &str, size: u64) -> Result<(), ApiError> {
        if size == 0 {
            return Err(ApiError::ConfigurationError(format!(
                "{} must be greater than 0",
                name
            )));
        }

        Ok(())
    }

    pub fn validate_interval(name: &str, secs: u64) -> Result<(), ApiError> {
        if secs == 0 {
            return Err(ApiError::ConfigurationError(format!(
                "{} must be at least 1 second",
                name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_database_url() {
        assert!(ConfigValidator::validate_database_url("postgres://u:p@db/coupons").is_ok());
        assert!(ConfigValidator::validate_database_url("postgresql://db/coupons").is_ok());
        assert!(ConfigValidator::validate_database_url("mysql://db/coupons").is_err());
    }

    #[test]
    fn test_batch_size_and_interval() {
        assert!(ConfigValidator::validate_batch_size("VOTE_BATCH_SIZE", 100).is_ok());
        assert!(ConfigValidator::validate_batch_size("VOTE_BATCH_SIZE", 0).is_err());
        assert!(ConfigValidator::validate_interval("CACHE_TTL_SECS", 0).is_err());
    }
}

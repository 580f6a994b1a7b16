//! Syrup browser-extension compatibility API.
//!
//! Served from the same store, vote queue, cache and limiters as the native
//! routes. Only the payload shapes and the error body differ.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::keys;
use crate::error::ApiError;
use crate::handlers::{cached_merchants, queue_vote, AppState};
use crate::models::{Coupon, SearchParams, SearchScope, SortBy, VoteDirection};

pub const API_VERSION: &str = "1.0.0";
pub const PROVIDER: &str = "DiscountDB";

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyrupCoupon {
    pub id: String,
    pub title: String,
    pub description: String,
    pub code: String,
    pub score: f64,
    pub merchant_name: String,
}

impl From<&Coupon> for SyrupCoupon {
    fn from(coupon: &Coupon) -> Self {
        Self {
            id: coupon.id.to_string(),
            title: coupon.title.clone(),
            description: coupon.description.clone(),
            code: coupon.code.clone(),
            score: coupon.materialized_score,
            merchant_name: coupon.merchant_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyrupCouponList {
    pub coupons: Vec<SyrupCoupon>,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyrupMerchant {
    pub merchant_name: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyrupMerchantList {
    pub merchants: Vec<SyrupMerchant>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyrupSuccess {
    pub success: String,
}

/// `{error, message}` body with PascalCase error names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyrupError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
}

impl SyrupError {
    fn bad_request(error: &'static str, message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
            message: message.to_string(),
        }
    }
}

impl From<ApiError> for SyrupError {
    fn from(err: ApiError) -> Self {
        let status = err.status_code();
        let (error, message) = match &err {
            ApiError::InvalidRequest(msg) | ApiError::ValidationError(msg) => {
                ("BadRequest", msg.clone())
            }
            ApiError::NotFound(msg) => ("NotFound", msg.clone()),
            ApiError::RateLimitExceeded { .. } => {
                ("TooManyRequests", "Too many requests".to_string())
            }
            ApiError::QueueFull => (
                "ServiceUnavailable",
                "Vote queue is full, try again later".to_string(),
            ),
            _ if status.is_server_error() && status != StatusCode::INTERNAL_SERVER_ERROR => {
                ("ServiceUnavailable", "Service temporarily unavailable".to_string())
            }
            _ => ("InternalServerError", "Something went wrong".to_string()),
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "syrup request failed");
        }

        Self {
            status,
            error,
            message,
        }
    }
}

#[derive(Serialize)]
struct SyrupErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl IntoResponse for SyrupError {
    fn into_response(self) -> Response {
        let body = SyrupErrorBody {
            error: self.error,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Reads `domain`, `limit` (1..=100, default 20) and `offset` (>= 0).
/// Results are matched on merchant URL and ranked by score.
pub fn parse_coupon_query(query: &HashMap<String, String>) -> Result<SearchParams, SyrupError> {
    let mut params = SearchParams {
        search_string: query.get("domain").filter(|domain| !domain.is_empty()).cloned(),
        scope: SearchScope::MerchantUrl,
        sort_by: SortBy::HighScore,
        limit: DEFAULT_LIMIT,
        offset: 0,
    };

    if let Some(limit) = query.get("limit").filter(|value| !value.is_empty()) {
        let limit: i64 = limit
            .parse()
            .map_err(|_| SyrupError::bad_request("InvalidLimit", "Invalid limit value"))?;
        if limit < 1 {
            return Err(SyrupError::bad_request(
                "InvalidLimit",
                "Limit must be greater than 0",
            ));
        }
        if limit > MAX_LIMIT {
            return Err(SyrupError::bad_request(
                "InvalidLimit",
                "Limit must be less than or equal to 100",
            ));
        }
        params.limit = limit;
    }

    if let Some(offset) = query.get("offset").filter(|value| !value.is_empty()) {
        let offset: i64 = offset
            .parse()
            .map_err(|_| SyrupError::bad_request("InvalidOffset", "Invalid offset value"))?;
        if offset < 0 {
            return Err(SyrupError::bad_request(
                "InvalidOffset",
                "Offset must be greater than or equal to 0",
            ));
        }
        params.offset = offset;
    }

    Ok(params)
}

fn parse_coupon_id(id: &str) -> Result<i64, SyrupError> {
    id.parse::<i64>()
        .ok()
        .filter(|id| *id >= 1)
        .ok_or_else(|| SyrupError::bad_request("InvalidID", "Invalid coupon ID"))
}

pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: API_VERSION.to_string(),
        provider: PROVIDER.to_string(),
    })
}

pub async fn get_coupons(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<SyrupCouponList>, SyrupError> {
    let params = parse_coupon_query(&query)?;
    let key = keys::syrup_coupons(params.search_string.as_deref(), params.limit, params.offset);
    let store = state.store.clone();

    let list = state
        .cache
        .get_or_compute_default(&key, move || async move {
            let data = store.search(&params).await?;
            let total = store.total_count(&params).await?;
            Ok(SyrupCouponList {
                coupons: data.iter().map(SyrupCoupon::from).collect(),
                total,
            })
        })
        .await?;

    Ok(Json(list))
}

pub async fn get_merchants(
    State(state): State<AppState>,
) -> Result<Json<SyrupMerchantList>, SyrupError> {
    let merchants = cached_merchants(&state).await?;

    Ok(Json(SyrupMerchantList {
        total: merchants.total,
        merchants: merchants
            .data
            .into_iter()
            .map(|merchant| SyrupMerchant {
                merchant_name: merchant.name,
                domains: merchant.domains,
            })
            .collect(),
    }))
}

/// A code that worked counts as an up-vote.
pub async fn post_valid(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyrupSuccess>, SyrupError> {
    report(&state, &id, VoteDirection::Up).await
}

/// A code that failed counts as a down-vote.
pub async fn post_invalid(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyrupSuccess>, SyrupError> {
    report(&state, &id, VoteDirection::Down).await
}

async fn report(
    state: &AppState,
    id: &str,
    direction: VoteDirection,
) -> Result<Json<SyrupSuccess>, SyrupError> {
    let coupon_id = parse_coupon_id(id)?;
    queue_vote(state, direction, coupon_id).await?;

    let verdict = match direction {
        VoteDirection::Up => "valid",
        VoteDirection::Down => "invalid",
    };
    Ok(Json(SyrupSuccess {
        success: format!("Coupon successfully reported as {}", verdict),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_coupon_query_defaults() {
        let params = parse_coupon_query(&query(&[("domain", "acme.com")])).unwrap();
        assert_eq!(params.search_string.as_deref(), Some("acme.com"));
        assert_eq!(params.scope, SearchScope::MerchantUrl);
        assert_eq!(params.sort_by, SortBy::HighScore);
        assert_eq!(params.limit, 20);
        assert_eq!(params.offset, 0);
    }

    #[test]
    fn test_coupon_query_bounds() {
        for (key, value, error) in [
            ("limit", "0", "InvalidLimit"),
            ("limit", "101", "InvalidLimit"),
            ("limit", "ten", "InvalidLimit"),
            ("offset", "-1", "InvalidOffset"),
            ("offset", "x", "InvalidOffset"),
        ] {
            let err = parse_coupon_query(&query(&[(key, value)])).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
            assert_eq!(err.error, error, "{}={}", key, value);
        }

        let params = parse_coupon_query(&query(&[("limit", "100"), ("offset", "40")])).unwrap();
        assert_eq!((params.limit, params.offset), (100, 40));
    }

    #[test]
    fn test_coupon_id() {
        assert_eq!(parse_coupon_id("12").unwrap(), 12);
        assert_eq!(parse_coupon_id("0").unwrap_err().error, "InvalidID");
        assert_eq!(parse_coupon_id("abc").unwrap_err().error, "InvalidID");
    }

    #[test]
    fn test_api_errors_keep_status() {
        let err = SyrupError::from(ApiError::QueueFull);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error, "ServiceUnavailable");

        let err = SyrupError::from(ApiError::DatabaseError("pool timed out".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Something went wrong");
    }
}

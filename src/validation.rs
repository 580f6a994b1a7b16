use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use validator::Validate;

use crate::error::ApiError;
use crate::models::{DiscountType, NewCoupon, SearchParams, SortBy, VoteDirection};

pub const MAX_SEARCH_LIMIT: i64 = 100;

const STORE_TYPES: [&str; 3] = ["online", "in_store", "both"];

/// Body of `POST /coupons`.
#[derive(Debug, Deserialize, Validate)]
pub struct CouponCreateRequest {
    #[validate(length(min = 1, max = 255, message = "Coupon code is required"))]
    pub code: String,
    #[validate(length(min = 1, max = 255, message = "Coupon title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Coupon description is required"))]
    pub description: String,
    #[serde(default)]
    #[validate(range(min = 0.0, message = "Discount value cannot be negative"))]
    pub discount_value: f64,
    pub discount_type: String,
    #[validate(length(min = 1, max = 255, message = "Merchant name is required"))]
    pub merchant_name: String,
    #[validate(length(min = 1, message = "Merchant URL is required"))]
    pub merchant_url: String,

    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terms_conditions: Option<String>,
    #[serde(default)]
    pub minimum_purchase_amount: Option<f64>,
    #[serde(default)]
    pub maximum_discount_amount: Option<f64>,

    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub store_type: Option<String>,
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates the `:dir` and `:id` path segments of a vote.
    pub fn validate_vote_params(dir: &str, id: &str) -> Result<(VoteDirection, i64), ApiError> {
        let direction: VoteDirection = dir.parse()?;

        let id = id
            .parse::<i64>()
            .ok()
            .filter(|id| *id >= 1)
            .ok_or_else(|| ApiError::InvalidRequest("Invalid coupon ID".to_string()))?;

        Ok((direction, id))
    }

    pub fn validate_coupon_id(id: &str) -> Result<i64, ApiError> {
        id.parse::<i64>()
            .map_err(|_| ApiError::InvalidRequest("Invalid coupon ID".to_string()))
    }

    /// Parses `q`, `sort_by`, `limit` and `offset` from a search query string.
    pub fn validate_search_params(
        query: &HashMap<String, String>,
    ) -> Result<SearchParams, ApiError> {
        let mut params = SearchParams {
            search_string: query.get("q").filter(|q| !q.is_empty()).cloned(),
            ..SearchParams::default()
        };

        if let Some(sort_by) = query.get("sort_by") {
            params.sort_by = sort_by.parse::<SortBy>()?;
        }

        if let Some(limit) = query.get("limit").filter(|value| !value.is_empty()) {
            let limit: i64 = limit.parse().map_err(|_| {
                ApiError::InvalidRequest(format!("invalid limit parameter: {}", limit))
            })?;
            if limit < 1 {
                return Err(ApiError::InvalidRequest(
                    "limit must be greater than 0".to_string(),
                ));
            }
            if limit > MAX_SEARCH_LIMIT {
                return Err(ApiError::InvalidRequest(format!(
                    "limit must be less than or equal to {}",
                    MAX_SEARCH_LIMIT
                )));
            }
            params.limit = limit;
        }

        if let Some(offset) = query.get("offset").filter(|value| !value.is_empty()) {
            let offset: i64 = offset.parse().map_err(|_| {
                ApiError::InvalidRequest(format!("invalid offset parameter: {}", offset))
            })?;
            if offset < 0 {
                return Err(ApiError::InvalidRequest(
                    "offset must be non-negative".to_string(),
                ));
            }
            params.offset = offset;
        }

        Ok(params)
    }

    /// Decodes and validates a coupon creation body.
    pub fn validate_coupon_request(body: &[u8]) -> Result<NewCoupon, ApiError> {
        let request: CouponCreateRequest = serde_json::from_slice(body)
            .map_err(|_| ApiError::InvalidRequest("Invalid request payload".to_string()))?;
        request.validate()?;

        let discount_type: DiscountType = request.discount_type.parse()?;

        if request.discount_value == 0.0
            && !matches!(discount_type, DiscountType::Bogo | DiscountType::FreeShipping)
        {
            return Err(ApiError::InvalidRequest(
                "Discount value is required".to_string(),
            ));
        }

        if let Some(store_type) = request.store_type.as_deref() {
            if !STORE_TYPES.contains(&store_type) {
                return Err(ApiError::InvalidRequest(format!(
                    "Invalid store type: {}",
                    store_type
                )));
            }
        }

        let merchant_url = strip_scheme(request.merchant_url.trim()).to_string();
        if merchant_url.is_empty() {
            return Err(ApiError::InvalidRequest(
                "Merchant URL is required".to_string(),
            ));
        }

        Ok(NewCoupon {
            code: request.code,
            title: request.title,
            description: request.description,
            discount_value: request.discount_value,
            discount_type,
            merchant_name: request.merchant_name,
            merchant_url,
            start_date: request.start_date,
            end_date: request.end_date,
            terms_conditions: request.terms_conditions,
            minimum_purchase_amount: request.minimum_purchase_amount,
            maximum_discount_amount: request.maximum_discount_amount,
            categories: request.categories,
            tags: request.tags,
            regions: request.regions,
            store_type: request.store_type,
        })
    }
}

fn strip_scheme(url: &str) -> &str {
    let url = url.strip_prefix("https://").unwrap_or(url);
    url.strip_prefix("http://").unwrap_or(url)
}

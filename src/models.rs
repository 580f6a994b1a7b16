use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;
use crate::scoring::ScoreInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    PercentageOff,
    FixedAmount,
    Bogo,
    FreeShipping,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::PercentageOff => "PERCENTAGE_OFF",
            DiscountType::FixedAmount => "FIXED_AMOUNT",
            DiscountType::Bogo => "BOGO",
            DiscountType::FreeShipping => "FREE_SHIPPING",
        }
    }
}

impl FromStr for DiscountType {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PERCENTAGE_OFF" => Ok(DiscountType::PercentageOff),
            "FIXED_AMOUNT" => Ok(DiscountType::FixedAmount),
            "BOGO" => Ok(DiscountType::Bogo),
            "FREE_SHIPPING" => Ok(DiscountType::FreeShipping),
            other => Err(ApiError::InvalidRequest(format!(
                "Invalid discount type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// Vote sequence column this direction appends to.
    pub fn column(&self) -> &'static str {
        match self {
            VoteDirection::Up => "up_votes",
            VoteDirection::Down => "down_votes",
        }
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteDirection::Up => write!(f, "up"),
            VoteDirection::Down => write!(f, "down"),
        }
    }
}

impl FromStr for VoteDirection {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(VoteDirection::Up),
            "down" => Ok(VoteDirection::Down),
            _ => Err(ApiError::InvalidRequest("Invalid vote direction".to_string())),
        }
    }
}

/// A pending vote as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEnvelope {
    #[serde(rename = "id")]
    pub coupon_id: i64,
    #[serde(rename = "timestamp")]
    pub received_at: DateTime<Utc>,
    #[serde(rename = "vote_type")]
    pub direction: VoteDirection,
}

impl VoteEnvelope {
    pub fn new(coupon_id: i64, direction: VoteDirection, received_at: DateTime<Utc>) -> Self {
        Self {
            coupon_id,
            received_at,
            direction,
        }
    }

    pub fn vote(&self) -> Vote {
        Vote {
            coupon_id: self.coupon_id,
            timestamp: self.received_at,
        }
    }
}

/// One `(coupon, receipt time)` pair handed to the batched vote append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub coupon_id: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub code: String,
    pub title: String,
    pub description: String,
    pub discount_value: f64,
    pub discount_type: DiscountType,
    pub merchant_name: String,
    pub merchant_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_purchase_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_discount_amount: Option<f64>,

    pub up_votes: Vec<DateTime<Utc>>,
    pub down_votes: Vec<DateTime<Utc>>,

    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_type: Option<String>,

    #[serde(rename = "score")]
    pub materialized_score: f64,
    #[serde(skip)]
    pub last_score_update: Option<DateTime<Utc>>,
}

impl Coupon {
    pub fn score_input(&self) -> ScoreInput<'_> {
        ScoreInput {
            discount_type: self.discount_type,
            discount_value: self.discount_value,
            maximum_discount_amount: self.maximum_discount_amount,
            created_at: self.created_at,
            up_votes: &self.up_votes,
            down_votes: &self.down_votes,
        }
    }
}

/// Validated fields for a coupon about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCoupon {
    pub code: String,
    pub title: String,
    pub description: String,
    pub discount_value: f64,
    pub discount_type: DiscountType,
    pub merchant_name: String,
    pub merchant_url: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub terms_conditions: Option<String>,
    pub minimum_purchase_amount: Option<f64>,
    pub maximum_discount_amount: Option<f64>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub regions: Vec<String>,
    pub store_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponCreateResponse {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Newest,
    Oldest,
    HighScore,
    LowScore,
}

impl FromStr for SortBy {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(SortBy::Newest),
            "oldest" => Ok(SortBy::Oldest),
            "high_score" => Ok(SortBy::HighScore),
            "low_score" => Ok(SortBy::LowScore),
            other => Err(ApiError::InvalidRequest(format!(
                "invalid sort_by parameter: {}",
                other
            ))),
        }
    }
}

/// Columns the search term is matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchScope {
    /// Code, title, description, merchant name and merchant URL
    #[default]
    AllText,
    /// Merchant URL only, for per-domain lookups
    MerchantUrl,
}

impl SearchScope {
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            SearchScope::AllText => &[
                "code",
                "title",
                "description",
                "merchant_name",
                "merchant_url",
            ],
            SearchScope::MerchantUrl => &["merchant_url"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub search_string: Option<String>,
    pub scope: SearchScope,
    pub sort_by: SortBy,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            search_string: None,
            scope: SearchScope::AllText,
            sort_by: SortBy::Newest,
            limit: 10,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponsSearchResponse {
    pub data: Vec<Coupon>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    #[serde(rename = "merchant_name")]
    pub name: String,
    #[serde(rename = "merchant_url")]
    pub domains: Vec<String>,
}

/// `{total, data}` envelope used by the collection listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub total: usize,
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self {
            total: data.len(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_envelope_wire_format() {
        let envelope = VoteEnvelope::new(
            7,
            VoteDirection::Down,
            "2025-01-02T03:04:05Z".parse().unwrap(),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["vote_type"], "down");
        assert_eq!(json["timestamp"], "2025-01-02T03:04:05Z");
    }

    #[test]
    fn test_vote_envelope_rejects_unknown_direction() {
        let raw = r#"{"id":7,"timestamp":"2025-01-02T03:04:05Z","vote_type":"sideways"}"#;
        assert!(serde_json::from_str::<VoteEnvelope>(raw).is_err());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("up".parse::<VoteDirection>().unwrap(), VoteDirection::Up);
        assert!("UP".parse::<VoteDirection>().is_err());
        assert_eq!("high_score".parse::<SortBy>().unwrap(), SortBy::HighScore);
        assert!("random".parse::<SortBy>().is_err());
        assert_eq!(
            "FREE_SHIPPING".parse::<DiscountType>().unwrap(),
            DiscountType::FreeShipping
        );
    }
}

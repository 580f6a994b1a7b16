//! Relational coupon store.
//!
//! [`CouponStore`] is the seam between the request/background paths and the
//! database. [`crate::postgres::PgCouponStore`] is the production backend;
//! [`InMemoryCouponStore`] mirrors its semantics for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::ApiError;
use crate::models::{
    Coupon, Merchant, NewCoupon, SearchParams, SearchScope, SortBy, Vote, VoteDirection,
};
use crate::scoring;

#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Insert a coupon with its score computed synchronously.
    async fn create(&self, coupon: NewCoupon) -> Result<Coupon, ApiError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Coupon>, ApiError>;

    async fn search(&self, params: &SearchParams) -> Result<Vec<Coupon>, ApiError>;

    /// Number of coupons matching the search filter, ignoring pagination.
    async fn total_count(&self, params: &SearchParams) -> Result<i64, ApiError>;

    async fn merchants(&self) -> Result<Vec<Merchant>, ApiError>;

    async fn categories(&self) -> Result<Vec<String>, ApiError>;

    async fn tags(&self) -> Result<Vec<String>, ApiError>;

    async fn regions(&self) -> Result<Vec<String>, ApiError>;

    /// Append every vote's timestamp to its coupon's `direction` sequence in
    /// one operation. Returns the number of coupons touched, or
    /// [`ApiError::NotFound`] when none of the ids exist.
    async fn batch_add_votes(
        &self,
        direction: VoteDirection,
        votes: &[Vote],
    ) -> Result<u64, ApiError>;

    /// Coupons whose materialized score is missing or past the freshness horizon.
    async fn count_stale(&self, now: DateTime<Utc>) -> Result<i64, ApiError>;

    /// Recompute and persist scores for up to `batch_size` stale coupons,
    /// skipping rows another writer currently holds. Returns rows updated.
    async fn materialize_batch(&self, batch_size: u32, now: DateTime<Utc>)
        -> Result<u64, ApiError>;

    async fn ping(&self) -> Result<(), ApiError>;
}

pub(crate) fn validate_batch_size(batch_size: u32) -> Result<(), ApiError> {
    if batch_size == 0 {
        return Err(ApiError::InvalidRequest(
            "batch size must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct InMemoryState {
    next_id: i64,
    coupons: BTreeMap<i64, Coupon>,
}

/// Map-backed store with the same observable behavior as the Postgres one.
#[derive(Clone, Default)]
pub struct InMemoryCouponStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fully-formed coupon as-is (id, timestamps and score included).
    pub async fn insert(&self, coupon: Coupon) {
        let mut state = self.state.write().await;
        state.next_id = state.next_id.max(coupon.id);
        state.coupons.insert(coupon.id, coupon);
    }

    fn matches(coupon: &Coupon, params: &SearchParams) -> bool {
        let needle = match params.search_string.as_deref() {
            Some(term) if !term.is_empty() => term.to_lowercase(),
            _ => return true,
        };

        let contains = |field: &String| field.to_lowercase().contains(&needle);
        match params.scope {
            SearchScope::AllText => [
                &coupon.code,
                &coupon.title,
                &coupon.description,
                &coupon.merchant_name,
                &coupon.merchant_url,
            ]
            .into_iter()
            .any(contains),
            SearchScope::MerchantUrl => contains(&coupon.merchant_url),
        }
    }

    async fn distinct(&self, pick: fn(&Coupon) -> &Vec<String>) -> Vec<String> {
        let state = self.state.read().await;
        state
            .coupons
            .values()
            .flat_map(|coupon| pick(coupon).iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn create(&self, coupon: NewCoupon) -> Result<Coupon, ApiError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.next_id += 1;

        let mut created = Coupon {
            id: state.next_id,
            created_at: now,
            code: coupon.code,
            title: coupon.title,
            description: coupon.description,
            discount_value: coupon.discount_value,
            discount_type: coupon.discount_type,
            merchant_name: coupon.merchant_name,
            merchant_url: coupon.merchant_url,
            start_date: coupon.start_date,
            end_date: coupon.end_date,
            terms_conditions: coupon.terms_conditions,
            minimum_purchase_amount: coupon.minimum_purchase_amount,
            maximum_discount_amount: coupon.maximum_discount_amount,
            up_votes: Vec::new(),
            down_votes: Vec::new(),
            categories: coupon.categories,
            tags: coupon.tags,
            regions: coupon.regions,
            store_type: coupon.store_type,
            materialized_score: 0.0,
            last_score_update: None,
        };
        created.materialized_score = scoring::score(&created.score_input(), now);
        created.last_score_update = Some(now);

        state.coupons.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Coupon>, ApiError> {
        Ok(self.state.read().await.coupons.get(&id).cloned())
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<Coupon>, ApiError> {
        let state = self.state.read().await;
        let mut found: Vec<Coupon> = state
            .coupons
            .values()
            .filter(|coupon| Self::matches(coupon, params))
            .cloned()
            .collect();

        match params.sort_by {
            SortBy::Newest => {
                found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)))
            }
            SortBy::Oldest => {
                found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            }
            SortBy::HighScore => found.sort_by(|a, b| {
                b.materialized_score
                    .total_cmp(&a.materialized_score)
                    .then(b.id.cmp(&a.id))
            }),
            SortBy::LowScore => found.sort_by(|a, b| {
                a.materialized_score
                    .total_cmp(&b.materialized_score)
                    .then(a.id.cmp(&b.id))
            }),
        }

        Ok(found
            .into_iter()
            .skip(params.offset.max(0) as usize)
            .take(params.limit.max(0) as usize)
            .collect())
    }

    async fn total_count(&self, params: &SearchParams) -> Result<i64, ApiError> {
        let state = self.state.read().await;
        Ok(state
            .coupons
            .values()
            .filter(|coupon| Self::matches(coupon, params))
            .count() as i64)
    }

    async fn merchants(&self) -> Result<Vec<Merchant>, ApiError> {
        let state = self.state.read().await;
        let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for coupon in state.coupons.values() {
            grouped
                .entry(coupon.merchant_name.clone())
                .or_default()
                .insert(coupon.merchant_url.clone());
        }

        Ok(grouped
            .into_iter()
            .map(|(name, domains)| Merchant {
                name,
                domains: domains.into_iter().collect(),
            })
            .collect())
    }

    async fn categories(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.distinct(|coupon| &coupon.categories).await)
    }

    async fn tags(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.distinct(|coupon| &coupon.tags).await)
    }

    async fn regions(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.distinct(|coupon| &coupon.regions).await)
    }

    async fn batch_add_votes(
        &self,
        direction: VoteDirection,
        votes: &[Vote],
    ) -> Result<u64, ApiError> {
        let mut by_coupon: HashMap<i64, Vec<DateTime<Utc>>> = HashMap::new();
        for vote in votes {
            by_coupon.entry(vote.coupon_id).or_default().push(vote.timestamp);
        }

        let mut state = self.state.write().await;
        let mut touched = 0;
        for (id, mut stamps) in by_coupon {
            if let Some(coupon) = state.coupons.get_mut(&id) {
                stamps.sort();
                match direction {
                    VoteDirection::Up => coupon.up_votes.extend(stamps),
                    VoteDirection::Down => coupon.down_votes.extend(stamps),
                }
                touched += 1;
            }
        }

        if touched == 0 {
            return Err(ApiError::NotFound(format!(
                "no coupons matched {} {} votes",
                votes.len(),
                direction
            )));
        }
        Ok(touched)
    }

    async fn count_stale(&self, now: DateTime<Utc>) -> Result<i64, ApiError> {
        let state = self.state.read().await;
        Ok(state
            .coupons
            .values()
            .filter(|coupon| scoring::is_stale(coupon.last_score_update, now))
            .count() as i64)
    }

    async fn materialize_batch(
        &self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, ApiError> {
        validate_batch_size(batch_size)?;

        // The write lock spans select + update, standing in for row locks.
        let mut state = self.state.write().await;
        let mut updated = 0;
        for coupon in state
            .coupons
            .values_mut()
            .filter(|coupon| scoring::is_stale(coupon.last_score_update, now))
            .take(batch_size as usize)
        {
            coupon.materialized_score = scoring::score(&coupon.score_input(), now);
            coupon.last_score_update = Some(now);
            updated += 1;
        }
        Ok(updated)
    }

    async fn ping(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::DiscountType;

    pub fn new_coupon(code: &str, merchant: &str) -> NewCoupon {
        NewCoupon {
            code: code.to_string(),
            title: format!("{} deal", code),
            description: "Save on your next order".to_string(),
            discount_value: 20.0,
            discount_type: DiscountType::PercentageOff,
            merchant_name: merchant.to_string(),
            merchant_url: format!("{}.example.com", merchant.to_lowercase()),
            start_date: None,
            end_date: None,
            terms_conditions: None,
            minimum_purchase_amount: None,
            maximum_discount_amount: None,
            categories: vec!["Electronics".to_string()],
            tags: vec!["online".to_string()],
            regions: vec!["CH".to_string()],
            store_type: Some("online".to_string()),
        }
    }
}

use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    Json,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::cache::{keys, ReadThroughCache};
use crate::error::ApiError;
use crate::health::{HealthChecker, HealthStatus};
use crate::models::{
    Coupon, CouponCreateResponse, CouponsSearchResponse, ListResponse, Merchant, VoteDirection,
    VoteEnvelope,
};
use crate::response::SuccessResponse;
use crate::store::CouponStore;
use crate::validation::RequestValidator;
use crate::vote_queue::VoteQueue;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CouponStore>,
    pub queue: Arc<dyn VoteQueue>,
    pub cache: ReadThroughCache,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CouponStore>,
        queue: Arc<dyn VoteQueue>,
        cache: ReadThroughCache,
    ) -> Self {
        let health = HealthChecker::new(store.clone(), queue.clone());
        Self {
            store,
            queue,
            cache,
            health,
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.health.check_health().await)
}

pub async fn search_coupons(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<CouponsSearchResponse>, ApiError> {
    let params = RequestValidator::validate_search_params(&query)?;
    let key = keys::search(raw_query.as_deref().unwrap_or_default());
    let store = state.store.clone();

    let response = state
        .cache
        .get_or_compute_default(&key, move || async move {
            let data = store.search(&params).await?;
            let total = store.total_count(&params).await?;
            Ok(CouponsSearchResponse {
                data,
                total,
                limit: params.limit,
                offset: params.offset,
            })
        })
        .await?;

    Ok(Json(response))
}

pub async fn get_coupon(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Coupon>, ApiError> {
    let id = RequestValidator::validate_coupon_id(&id)?;
    let store = state.store.clone();

    let coupon = state
        .cache
        .get_or_compute_default(&keys::coupon(id), move || async move {
            store
                .get_by_id(id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("Coupon {} not found", id)))
        })
        .await?;

    Ok(Json(coupon))
}

pub async fn get_merchants(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Merchant>>, ApiError> {
    Ok(Json(cached_merchants(&state).await?))
}

pub(crate) async fn cached_merchants(
    state: &AppState,
) -> Result<ListResponse<Merchant>, ApiError> {
    let store = state.store.clone();
    state
        .cache
        .get_or_compute_default(keys::MERCHANTS, move || async move {
            Ok(ListResponse::from(store.merchants().await?))
        })
        .await
}

pub async fn get_categories(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<String>>, ApiError> {
    let store = state.store.clone();
    let categories = state
        .cache
        .get_or_compute_default(keys::CATEGORIES, move || async move {
            Ok(ListResponse::from(store.categories().await?))
        })
        .await?;

    Ok(Json(categories))
}

pub async fn get_tags(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<String>>, ApiError> {
    let store = state.store.clone();
    let tags = state
        .cache
        .get_or_compute_default(keys::TAGS, move || async move {
            Ok(ListResponse::from(store.tags().await?))
        })
        .await?;

    Ok(Json(tags))
}

pub async fn get_regions(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<String>>, ApiError> {
    let store = state.store.clone();
    let regions = state
        .cache
        .get_or_compute_default(keys::REGIONS, move || async move {
            Ok(ListResponse::from(store.regions().await?))
        })
        .await?;

    Ok(Json(regions))
}

pub async fn create_coupon(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CouponCreateResponse>, ApiError> {
    let coupon = RequestValidator::validate_coupon_request(&body)?;
    let created = state.store.create(coupon).await?;

    info!(id = created.id, code = %created.code, "Coupon created");

    Ok(Json(CouponCreateResponse {
        id: created.id,
        created_at: created.created_at,
        score: created.materialized_score,
    }))
}

/// Queue an up- or down-vote; the aggregator applies it later.
pub async fn post_vote(
    State(state): State<AppState>,
    Path((dir, id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let (direction, coupon_id) = RequestValidator::validate_vote_params(&dir, &id)?;
    queue_vote(&state, direction, coupon_id).await?;
    Ok(Json(SuccessResponse::vote_queued()))
}

pub(crate) async fn queue_vote(
    state: &AppState,
    direction: VoteDirection,
    coupon_id: i64,
) -> Result<(), ApiError> {
    let pending = state
        .queue
        .push(&VoteEnvelope::new(coupon_id, direction, Utc::now()))
        .await?;

    info!(coupon_id, direction = %direction, pending, "Vote queued");
    Ok(())
}

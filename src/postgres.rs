//! Postgres implementation of [`CouponStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::error::ApiError;
use crate::models::{
    Coupon, DiscountType, Merchant, NewCoupon, SearchParams, SortBy, Vote, VoteDirection,
};
use crate::scoring::{self, ScoreInput};
use crate::store::{validate_batch_size, CouponStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS coupons (
        id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        code VARCHAR(255) NOT NULL,
        title VARCHAR(255) NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        discount_value DOUBLE PRECISION NOT NULL,
        discount_type VARCHAR(50) NOT NULL,
        merchant_name VARCHAR(255) NOT NULL,
        merchant_url TEXT NOT NULL,

        start_date TIMESTAMPTZ,
        end_date TIMESTAMPTZ,
        terms_conditions TEXT,
        minimum_purchase_amount DOUBLE PRECISION,
        maximum_discount_amount DOUBLE PRECISION,

        up_votes TIMESTAMPTZ[] NOT NULL DEFAULT ARRAY[]::TIMESTAMPTZ[],
        down_votes TIMESTAMPTZ[] NOT NULL DEFAULT ARRAY[]::TIMESTAMPTZ[],

        categories TEXT[] NOT NULL DEFAULT ARRAY[]::TEXT[],
        tags TEXT[] NOT NULL DEFAULT ARRAY[]::TEXT[],
        regions TEXT[] NOT NULL DEFAULT ARRAY[]::TEXT[],
        store_type VARCHAR(50),

        materialized_score DOUBLE PRECISION NOT NULL DEFAULT 0,
        last_score_update TIMESTAMPTZ,

        CONSTRAINT valid_discount_type CHECK (
            discount_type IN ('PERCENTAGE_OFF', 'FIXED_AMOUNT', 'BOGO', 'FREE_SHIPPING')
        ),
        CONSTRAINT valid_store_type CHECK (
            store_type IN ('online', 'in_store', 'both')
        )
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_coupons_merchant ON coupons(merchant_name)",
    "CREATE INDEX IF NOT EXISTS idx_coupons_created_at ON coupons(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_coupons_code ON coupons(code)",
    "CREATE INDEX IF NOT EXISTS idx_coupons_score ON coupons(materialized_score)",
    "CREATE INDEX IF NOT EXISTS idx_coupons_last_score_update ON coupons(last_score_update)",
];

const COUPON_COLUMNS: &str = "id, created_at, code, title, description, discount_value, \
    discount_type, merchant_name, merchant_url, start_date, end_date, terms_conditions, \
    minimum_purchase_amount, maximum_discount_amount, up_votes, down_votes, categories, \
    tags, regions, store_type, materialized_score, last_score_update";

const STALE_FILTER: &str = "last_score_update IS NULL OR last_score_update < $1";

#[derive(Debug, FromRow)]
struct CouponRow {
    id: i64,
    created_at: DateTime<Utc>,
    code: String,
    title: String,
    description: String,
    discount_value: f64,
    discount_type: String,
    merchant_name: String,
    merchant_url: String,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    terms_conditions: Option<String>,
    minimum_purchase_amount: Option<f64>,
    maximum_discount_amount: Option<f64>,
    up_votes: Vec<DateTime<Utc>>,
    down_votes: Vec<DateTime<Utc>>,
    categories: Vec<String>,
    tags: Vec<String>,
    regions: Vec<String>,
    store_type: Option<String>,
    materialized_score: f64,
    last_score_update: Option<DateTime<Utc>>,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = ApiError;

    fn try_from(row: CouponRow) -> Result<Self, Self::Error> {
        Ok(Coupon {
            id: row.id,
            created_at: row.created_at,
            code: row.code,
            title: row.title,
            description: row.description,
            discount_value: row.discount_value,
            discount_type: row
                .discount_type
                .parse()
                .map_err(|e: ApiError| ApiError::DatabaseError(e.to_string()))?,
            merchant_name: row.merchant_name,
            merchant_url: row.merchant_url,
            start_date: row.start_date,
            end_date: row.end_date,
            terms_conditions: row.terms_conditions,
            minimum_purchase_amount: row.minimum_purchase_amount,
            maximum_discount_amount: row.maximum_discount_amount,
            up_votes: row.up_votes,
            down_votes: row.down_votes,
            categories: row.categories,
            tags: row.tags,
            regions: row.regions,
            store_type: row.store_type,
            materialized_score: row.materialized_score,
            last_score_update: row.last_score_update,
        })
    }
}

/// Just the columns the scoring function reads.
#[derive(Debug, FromRow)]
struct ScoreRow {
    id: i64,
    created_at: DateTime<Utc>,
    discount_value: f64,
    discount_type: String,
    maximum_discount_amount: Option<f64>,
    up_votes: Vec<DateTime<Utc>>,
    down_votes: Vec<DateTime<Utc>>,
}

impl ScoreRow {
    fn score(&self, now: DateTime<Utc>) -> Result<f64, ApiError> {
        let discount_type: DiscountType = self
            .discount_type
            .parse()
            .map_err(|e: ApiError| ApiError::DatabaseError(e.to_string()))?;
        let input = ScoreInput {
            discount_type,
            discount_value: self.discount_value,
            maximum_discount_amount: self.maximum_discount_amount,
            created_at: self.created_at,
            up_votes: &self.up_votes,
            down_votes: &self.down_votes,
        };
        Ok(scoring::score(&input, now))
    }
}

/// Adds the text-search predicate shared by the page query and its count.
fn push_search_filter(builder: &mut QueryBuilder<'_, Postgres>, params: &SearchParams) {
    if let Some(term) = params.search_string.as_deref().filter(|term| !term.is_empty()) {
        let pattern = format!("%{}%", term);
        builder.push(" AND (");
        let mut fields = builder.separated(" OR ");
        for column in params.scope.columns() {
            fields.push(format!("{} ILIKE ", column));
            fields.push_bind_unseparated(pattern.clone());
        }
        builder.push(")");
    }
}

fn order_clause(sort_by: SortBy) -> &'static str {
    match sort_by {
        SortBy::Newest => " ORDER BY created_at DESC, id DESC",
        SortBy::Oldest => " ORDER BY created_at ASC, id ASC",
        SortBy::HighScore => " ORDER BY materialized_score DESC, id DESC",
        SortBy::LowScore => " ORDER BY materialized_score ASC, id ASC",
    }
}

#[derive(Clone)]
pub struct PgCouponStore {
    pool: PgPool,
}

impl PgCouponStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ApiError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_table(&self) -> Result<(), ApiError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn distinct_array_values(&self, column: &'static str) -> Result<Vec<String>, ApiError> {
        let query = format!(
            "SELECT DISTINCT value FROM coupons, unnest({}) AS value ORDER BY 1",
            column
        );
        Ok(sqlx::query_scalar::<_, String>(&query)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl CouponStore for PgCouponStore {
    async fn create(&self, coupon: NewCoupon) -> Result<Coupon, ApiError> {
        let now = Utc::now();
        let score = scoring::score(
            &ScoreInput {
                discount_type: coupon.discount_type,
                discount_value: coupon.discount_value,
                maximum_discount_amount: coupon.maximum_discount_amount,
                created_at: now,
                up_votes: &[],
                down_votes: &[],
            },
            now,
        );

        let query = format!(
            r#"
            INSERT INTO coupons (
                created_at, code, title, description, discount_value, discount_type,
                merchant_name, merchant_url, start_date, end_date, terms_conditions,
                minimum_purchase_amount, maximum_discount_amount, categories, tags,
                regions, store_type, materialized_score, last_score_update
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $1
            ) RETURNING {}
            "#,
            COUPON_COLUMNS
        );

        let row = sqlx::query_as::<_, CouponRow>(&query)
            .bind(now)
            .bind(&coupon.code)
            .bind(&coupon.title)
            .bind(&coupon.description)
            .bind(coupon.discount_value)
            .bind(coupon.discount_type.as_str())
            .bind(&coupon.merchant_name)
            .bind(&coupon.merchant_url)
            .bind(coupon.start_date)
            .bind(coupon.end_date)
            .bind(&coupon.terms_conditions)
            .bind(coupon.minimum_purchase_amount)
            .bind(coupon.maximum_discount_amount)
            .bind(&coupon.categories)
            .bind(&coupon.tags)
            .bind(&coupon.regions)
            .bind(&coupon.store_type)
            .bind(score)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Coupon>, ApiError> {
        let query = format!("SELECT {} FROM coupons WHERE id = $1", COUPON_COLUMNS);
        sqlx::query_as::<_, CouponRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Coupon::try_from)
            .transpose()
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<Coupon>, ApiError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM coupons WHERE 1=1",
            COUPON_COLUMNS
        ));
        push_search_filter(&mut builder, params);
        builder.push(order_clause(params.sort_by));
        builder.push(" LIMIT ").push_bind(params.limit);
        builder.push(" OFFSET ").push_bind(params.offset);

        builder
            .build_query_as::<CouponRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Coupon::try_from)
            .collect()
    }

    async fn total_count(&self, params: &SearchParams) -> Result<i64, ApiError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM coupons WHERE 1=1");
        push_search_filter(&mut builder, params);

        Ok(builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?)
    }

    async fn merchants(&self) -> Result<Vec<Merchant>, ApiError> {
        let rows: Vec<(String, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT merchant_name, array_agg(DISTINCT merchant_url ORDER BY merchant_url)
            FROM coupons
            GROUP BY merchant_name
            ORDER BY merchant_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, domains)| Merchant { name, domains })
            .collect())
    }

    async fn categories(&self) -> Result<Vec<String>, ApiError> {
        self.distinct_array_values("categories").await
    }

    async fn tags(&self) -> Result<Vec<String>, ApiError> {
        self.distinct_array_values("tags").await
    }

    async fn regions(&self) -> Result<Vec<String>, ApiError> {
        self.distinct_array_values("regions").await
    }

    async fn batch_add_votes(
        &self,
        direction: VoteDirection,
        votes: &[Vote],
    ) -> Result<u64, ApiError> {
        if votes.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = votes.iter().map(|vote| vote.coupon_id).collect();
        let timestamps: Vec<DateTime<Utc>> = votes.iter().map(|vote| vote.timestamp).collect();

        // Votes are grouped per coupon first: UPDATE ... FROM applies at most
        // one joined row to each target, which would drop repeat votes.
        let query = format!(
            r#"
            UPDATE coupons AS c
            SET {column} = c.{column} || v.stamps
            FROM (
                SELECT id, array_agg(ts ORDER BY ts) AS stamps
                FROM unnest($1::bigint[], $2::timestamptz[]) AS t(id, ts)
                GROUP BY id
            ) AS v
            WHERE c.id = v.id
            "#,
            column = direction.column()
        );

        let result = sqlx::query(&query)
            .bind(&ids)
            .bind(&timestamps)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound(format!(
                "no coupons matched {} {} votes",
                votes.len(),
                direction
            )));
        }
        Ok(result.rows_affected())
    }

    async fn count_stale(&self, now: DateTime<Utc>) -> Result<i64, ApiError> {
        let query = format!("SELECT COUNT(*) FROM coupons WHERE {}", STALE_FILTER);
        Ok(sqlx::query_scalar::<_, i64>(&query)
            .bind(now - scoring::freshness_horizon())
            .fetch_one(&self.pool)
            .await?)
    }

    async fn materialize_batch(
        &self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, ApiError> {
        validate_batch_size(batch_size)?;

        let mut tx = self.pool.begin().await?;

        let query = format!(
            r#"
            SELECT id, created_at, discount_value, discount_type, maximum_discount_amount,
                   up_votes, down_votes
            FROM coupons
            WHERE {}
            ORDER BY id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
            STALE_FILTER
        );
        let rows = sqlx::query_as::<_, ScoreRow>(&query)
            .bind(now - scoring::freshness_horizon())
            .bind(batch_size as i64)
            .fetch_all(&mut *tx)
            .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let scores = rows
            .iter()
            .map(|row| row.score(now))
            .collect::<Result<Vec<f64>, ApiError>>()?;

        let result = sqlx::query(
            r#"
            UPDATE coupons AS c
            SET materialized_score = v.score, last_score_update = $3
            FROM unnest($1::bigint[], $2::float8[]) AS v(id, score)
            WHERE c.id = v.id
            "#,
        )
        .bind(&ids)
        .bind(&scores)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(rows = result.rows_affected(), "materialized score batch");
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), ApiError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

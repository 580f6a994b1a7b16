use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::aggregator::VoteAggregator;
use crate::cache::ReadThroughCache;
use crate::config::Config;
use crate::error::ApiError;
use crate::handlers::{
    create_coupon, get_categories, get_coupon, get_merchants, get_regions, get_tags,
    health_check, post_vote, search_coupons, AppState,
};
use crate::key_generator::{ClientIpSource, KeyStrategy};
use crate::materializer::ScoreMaterializer;
use crate::middleware::{logging_middleware, rate_limit_middleware};
use crate::postgres::PgCouponStore;
use crate::rate_limit_config::{FailurePolicy, RateLimitRule};
use crate::rate_limiter::{CounterStore, RateLimiter, RedisCounterStore};
use crate::redis::RedisClient;
use crate::store::CouponStore;
use crate::syrup;
use crate::vote_queue::{RedisVoteQueue, VoteQueue};

/// The three limiter presets the routes are guarded by.
#[derive(Clone)]
pub struct Limiters {
    pub default: Arc<RateLimiter>,
    pub vote: Arc<RateLimiter>,
    pub single_vote: Arc<RateLimiter>,
}

impl Limiters {
    pub fn new(
        store: Arc<dyn CounterStore>,
        policy: FailurePolicy,
        ip_source: ClientIpSource,
    ) -> Result<Self, ApiError> {
        let limiter = |rule: RateLimitRule, strategy: KeyStrategy| {
            RateLimiter::new(store.clone(), rule, strategy, policy)
                .map(|limiter| Arc::new(limiter.with_ip_source(ip_source)))
        };

        Ok(Self {
            default: limiter(RateLimitRule::default(), KeyStrategy::IpAddress)?,
            vote: limiter(RateLimitRule::vote(), KeyStrategy::IpAddress)?,
            single_vote: limiter(
                RateLimitRule::single_vote(),
                KeyStrategy::IpAndPathParam("id".to_string()),
            )?,
        })
    }
}

/// Builds the `/api/v1` router. Limiters are attached per route so they see
/// the matched path parameters.
pub fn create_app(state: AppState, limiters: &Limiters) -> Router {
    let limit = |limiter: &Arc<RateLimiter>| {
        middleware::from_fn_with_state(limiter.clone(), rate_limit_middleware)
    };

    let api = Router::new()
        .route("/health", get(health_check))
        .route(
            "/coupons",
            post(create_coupon).layer(limit(&limiters.default)),
        )
        .route(
            "/coupons/search",
            get(search_coupons).layer(limit(&limiters.default)),
        )
        .route(
            "/coupons/merchants",
            get(get_merchants).layer(limit(&limiters.default)),
        )
        .route(
            "/coupons/categories",
            get(get_categories).layer(limit(&limiters.default)),
        )
        .route(
            "/coupons/tags",
            get(get_tags).layer(limit(&limiters.default)),
        )
        .route(
            "/coupons/regions",
            get(get_regions).layer(limit(&limiters.default)),
        )
        .route(
            "/coupons/:id",
            get(get_coupon).layer(limit(&limiters.default)),
        )
        // The outer vote limiter runs first; the per-coupon one second.
        .route(
            "/coupons/vote/:dir/:id",
            post(post_vote)
                .layer(limit(&limiters.single_vote))
                .layer(limit(&limiters.vote)),
        )
        .route("/syrup/version", get(syrup::get_version))
        .route(
            "/syrup/coupons",
            get(syrup::get_coupons).layer(limit(&limiters.default)),
        )
        .route(
            "/syrup/merchants",
            get(syrup::get_merchants).layer(limit(&limiters.default)),
        )
        // Reports share the native vote budgets, keyed on the same `:id`.
        .route(
            "/syrup/coupons/valid/:id",
            post(syrup::post_valid)
                .layer(limit(&limiters.single_vote))
                .layer(limit(&limiters.vote)),
        )
        .route(
            "/syrup/coupons/invalid/:id",
            post(syrup::post_invalid)
                .layer(limit(&limiters.single_vote))
                .layer(limit(&limiters.vote)),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(middleware::from_fn(logging_middleware)),
    )
}

pub struct Server {
    config: Config,
    app: Router,
    aggregator: VoteAggregator,
    materializer: ScoreMaterializer,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, ApiError> {
        let redis = RedisClient::connect(&config.redis_url).await?;

        let pg = PgCouponStore::connect(&config.database_url, config.db_max_connections).await?;
        pg.create_table().await?;

        let store: Arc<dyn CouponStore> = Arc::new(pg);
        let queue: Arc<dyn VoteQueue> =
            Arc::new(RedisVoteQueue::new(redis.clone(), config.vote_queue_max_len));
        let cache = ReadThroughCache::new(Arc::new(redis.clone()), config.cache_ttl());

        let limiters = Limiters::new(
            Arc::new(RedisCounterStore::new(redis)),
            config.failure_policy(),
            config.client_ip_source(),
        )?;

        let aggregator = VoteAggregator::new(queue.clone(), store.clone())
            .with_batch_size(config.vote_batch_size)
            .with_poll_interval(config.vote_poll_interval());
        let materializer = ScoreMaterializer::new(store.clone(), config.score_batch_size)?
            .with_interval(config.score_update_interval())
            .with_batch_pause(config.score_batch_pause());

        let app = create_app(AppState::new(store, queue, cache), &limiters);

        Ok(Self {
            config,
            app,
            aggregator,
            materializer,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let restart_delay = self.config.supervisor_restart_delay();
        let aggregator = self.aggregator;
        let aggregator_shutdown = shutdown_rx.clone();
        let aggregator_task = tokio::spawn(async move {
            supervise_aggregator(&aggregator, aggregator_shutdown, restart_delay).await
        });

        let materializer = self.materializer;
        let materializer_task = tokio::spawn(async move { materializer.run(shutdown_rx).await });

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        info!("discountdb API listening on {}", self.config.bind_addr);
        info!("Health check available at /api/v1/health");

        let served = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        // Background loops finish their in-flight batch before exiting.
        let _ = shutdown_tx.send(true);
        let (aggregator_result, materializer_result) =
            tokio::join!(aggregator_task, materializer_task);
        if let Err(e) = aggregator_result {
            error!(error = %e, "Vote aggregator task panicked");
        }
        if let Err(e) = materializer_result {
            error!(error = %e, "Score materializer task panicked");
        }

        served?;
        info!("Shutdown complete");
        Ok(())
    }
}

/// Keeps the aggregator running, restarting it after `restart_delay` each
/// time it returns an error.
pub(crate) async fn supervise_aggregator(
    aggregator: &VoteAggregator,
    mut shutdown: watch::Receiver<bool>,
    restart_delay: Duration,
) {
    loop {
        match aggregator.run(shutdown.clone()).await {
            Ok(()) => return,
            Err(e) => {
                error!(error = %e, ?restart_delay, "Vote aggregator failed, restarting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

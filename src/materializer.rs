use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::error::ApiError;
use crate::store::{validate_batch_size, CouponStore};

pub const DEFAULT_BATCH_SIZE: u32 = 1000;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Periodically refreshes stale materialized scores in bounded batches.
pub struct ScoreMaterializer {
    store: Arc<dyn CouponStore>,
    batch_size: u32,
    interval: Duration,
    batch_pause: Duration,
}

impl ScoreMaterializer {
    pub fn new(store: Arc<dyn CouponStore>, batch_size: u32) -> Result<Self, ApiError> {
        validate_batch_size(batch_size)?;
        Ok(Self {
            store,
            batch_size,
            interval: DEFAULT_INTERVAL,
            batch_pause: DEFAULT_BATCH_PAUSE,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_pause(mut self, batch_pause: Duration) -> Self {
        self.batch_pause = batch_pause;
        self
    }

    /// One refresh pass. Returns the number of scores written.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u64, ApiError> {
        let total = self.store.count_stale(now).await?;
        if total <= 0 {
            return Ok(0);
        }

        let batches = (total as u64).div_ceil(self.batch_size as u64);
        let mut updated = 0;

        for batch in 0..batches {
            if batch > 0 {
                tokio::time::sleep(self.batch_pause).await;
            }

            let rows = self.store.materialize_batch(self.batch_size, now).await?;
            if rows == 0 {
                // Everything left is locked by another worker.
                break;
            }
            updated += rows;
        }

        info!(stale = total, updated, "Updated materialized scores");
        Ok(updated)
    }

    /// Ticks immediately, then every interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            batch_size = self.batch_size,
            "Score materializer started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "Score materialization failed");
            }
        }

        info!("Score materializer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::new_coupon;
    use crate::store::InMemoryCouponStore;
    use chrono::Duration as ChronoDuration;

    async fn store_with(count: usize) -> Arc<InMemoryCouponStore> {
        let store = Arc::new(InMemoryCouponStore::new());
        for i in 0..count {
            store
                .create(new_coupon(&format!("CODE{}", i), "Acme"))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let store = Arc::new(InMemoryCouponStore::new());
        assert!(ScoreMaterializer::new(store, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_updates_all_stale_rows_in_batches() {
        let store = store_with(5).await;
        let materializer = ScoreMaterializer::new(store.clone(), 2).unwrap();
        let later = Utc::now() + ChronoDuration::hours(2);

        assert_eq!(materializer.tick(later).await.unwrap(), 5);
        assert_eq!(store.count_stale(later).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_without_stale_rows_is_noop() {
        let store = store_with(3).await;
        let materializer = ScoreMaterializer::new(store, 10).unwrap();

        // Freshly created coupons were scored on insert.
        assert_eq!(materializer.tick(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_reflects_new_votes() {
        let store = store_with(1).await;
        let materializer = ScoreMaterializer::new(store.clone(), 10).unwrap();
        let before = store.get_by_id(1).await.unwrap().unwrap().materialized_score;

        let now = Utc::now();
        let votes = [crate::models::Vote {
            coupon_id: 1,
            timestamp: now,
        }];
        store
            .batch_add_votes(crate::models::VoteDirection::Up, &votes)
            .await
            .unwrap();

        let later = now + ChronoDuration::hours(2);
        materializer.tick(later).await.unwrap();

        let after = store.get_by_id(1).await.unwrap().unwrap().materialized_score;
        assert!(after > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_at_startup_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryCouponStore::new());
        let mut coupon = store.create(new_coupon("OLD", "Acme")).await.unwrap();
        coupon.last_score_update = None;
        store.insert(coupon).await;

        let materializer = ScoreMaterializer::new(store.clone(), 10)
            .unwrap()
            .with_interval(Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { materializer.run(rx).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.count_stale(Utc::now()).await.unwrap(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

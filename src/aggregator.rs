use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Vote, VoteDirection, VoteEnvelope};
use crate::store::CouponStore;
use crate::vote_queue::VoteQueue;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on one peek-apply-ack cycle; a crashed holder blocks others this long.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged, malformed ones included.
    pub acked: usize,
    pub up_votes: usize,
    pub down_votes: usize,
    pub malformed: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.acked == 0
    }
}

/// Folds queued votes into the coupon store.
///
/// Every API instance runs one; the queue's drain lease lets only one of
/// them move a batch at a time.
pub struct VoteAggregator {
    queue: Arc<dyn VoteQueue>,
    store: Arc<dyn CouponStore>,
    batch_size: usize,
    poll_interval: Duration,
    lease_ttl: Duration,
    consumer_id: String,
}

impl VoteAggregator {
    pub fn new(queue: Arc<dyn VoteQueue>, store: Arc<dyn CouponStore>) -> Self {
        Self {
            queue,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
            consumer_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Moves at most one batch from the queue into the store.
    ///
    /// The peeked prefix is acknowledged only once every direction has been
    /// written, so a failure leaves the whole batch queued for the next cycle.
    /// Returns an empty report without touching the queue while another
    /// consumer holds the drain lease.
    pub async fn drain_once(&self) -> Result<DrainReport, ApiError> {
        if !self
            .queue
            .acquire_lease(&self.consumer_id, self.lease_ttl)
            .await?
        {
            debug!(consumer = %self.consumer_id, "Drain lease held by another consumer");
            return Ok(DrainReport::default());
        }

        let result = self.drain_batch().await;

        if let Err(e) = self.queue.release_lease(&self.consumer_id).await {
            warn!(consumer = %self.consumer_id, error = %e, "Failed to release drain lease");
        }
        result
    }

    async fn drain_batch(&self) -> Result<DrainReport, ApiError> {
        let entries = self.queue.peek(self.batch_size).await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport {
            acked: entries.len(),
            ..DrainReport::default()
        };
        let mut up = Vec::new();
        let mut down = Vec::new();

        for raw in &entries {
            match serde_json::from_str::<VoteEnvelope>(raw) {
                Ok(envelope) => match envelope.direction {
                    VoteDirection::Up => up.push(envelope.vote()),
                    VoteDirection::Down => down.push(envelope.vote()),
                },
                Err(e) => {
                    warn!(entry = %raw, error = %e, "Dropping malformed vote entry");
                    report.malformed += 1;
                }
            }
        }

        report.up_votes = up.len();
        report.down_votes = down.len();

        self.apply(VoteDirection::Up, &up).await?;
        self.apply(VoteDirection::Down, &down).await?;

        self.queue.ack(entries.len()).await?;

        debug!(
            acked = report.acked,
            up = report.up_votes,
            down = report.down_votes,
            malformed = report.malformed,
            "Drained vote batch"
        );
        Ok(report)
    }

    async fn apply(&self, direction: VoteDirection, votes: &[Vote]) -> Result<(), ApiError> {
        if votes.is_empty() {
            return Ok(());
        }

        match self.store.batch_add_votes(direction, votes).await {
            Ok(_) => Ok(()),
            // Votes for coupons that no longer exist can never be applied.
            Err(ApiError::NotFound(message)) => {
                warn!(
                    direction = %direction,
                    votes = votes.len(),
                    %message,
                    "Votes matched no coupons"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drains until `shutdown` flips to true. Returns the first store or
    /// queue error so the caller can decide when to restart.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ApiError> {
        info!(
            batch_size = self.batch_size,
            poll_interval = ?self.poll_interval,
            "Vote aggregator started"
        );

        while !*shutdown.borrow() {
            let report = self.drain_once().await?;
            if !report.is_empty() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Vote aggregator stopped");
        Ok(())
    }
}

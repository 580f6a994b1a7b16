//! Composite ranking score.
//!
//! `score` is the only implementation of the ranking formula. Both the
//! periodic materializer and the synchronous recompute on insert call it, so
//! the two paths cannot drift apart. Age buckets use interval semantics of
//! the relational store: a month is 30 days and comparisons are strict.

use chrono::{DateTime, Duration, Utc};

use crate::models::DiscountType;

const VOTE_WEIGHT: f64 = 0.4;
const DISCOUNT_WEIGHT: f64 = 0.4;
const FRESHNESS_WEIGHT: f64 = 0.2;

/// Fixed-amount discounts without a cap are measured against this amount.
const FIXED_AMOUNT_REFERENCE: f64 = 1000.0;

/// A materialized score older than this is recomputed on the next run.
pub fn freshness_horizon() -> Duration {
    Duration::hours(1)
}

/// Everything the score depends on besides the clock.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub discount_type: DiscountType,
    pub discount_value: f64,
    pub maximum_discount_amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub up_votes: &'a [DateTime<Utc>],
    pub down_votes: &'a [DateTime<Utc>],
}

pub fn score(input: &ScoreInput<'_>, now: DateTime<Utc>) -> f64 {
    VOTE_WEIGHT * vote_component(input.up_votes, input.down_votes, now)
        + DISCOUNT_WEIGHT
            * discount_component(
                input.discount_type,
                input.discount_value,
                input.maximum_discount_amount,
            )
        + FRESHNESS_WEIGHT * freshness_component(now - input.created_at)
}

pub fn is_stale(last_score_update: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_score_update {
        None => true,
        Some(updated) => updated < now - freshness_horizon(),
    }
}

pub fn vote_component(
    up_votes: &[DateTime<Utc>],
    down_votes: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> f64 {
    let weigh = |votes: &[DateTime<Utc>]| -> f64 {
        votes.iter().map(|cast| vote_weight(now - *cast)).sum()
    };
    weigh(up_votes) - weigh(down_votes)
}

pub fn vote_weight(age: Duration) -> f64 {
    if age < Duration::days(1) {
        1.0
    } else if age < Duration::weeks(1) {
        0.8
    } else if age < Duration::days(30) {
        0.6
    } else if age < Duration::days(180) {
        0.4
    } else {
        0.2
    }
}

pub fn discount_component(
    discount_type: DiscountType,
    value: f64,
    maximum_discount_amount: Option<f64>,
) -> f64 {
    match discount_type {
        DiscountType::PercentageOff => (value / 100.0).min(1.0),
        DiscountType::FixedAmount => match maximum_discount_amount {
            Some(max) if max > 0.0 => (value / max).min(1.0),
            _ => (value / FIXED_AMOUNT_REFERENCE).min(1.0),
        },
        DiscountType::Bogo | DiscountType::FreeShipping => 0.5,
    }
}

pub fn freshness_component(age: Duration) -> f64 {
    if age < Duration::days(1) {
        1.0
    } else if age < Duration::weeks(1) {
        0.8
    } else if age < Duration::days(30) {
        0.6
    } else if age < Duration::days(90) {
        0.4
    } else if age < Duration::days(180) {
        0.2
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_free_shipping_without_votes() {
        let input = ScoreInput {
            discount_type: DiscountType::FreeShipping,
            discount_value: 0.0,
            maximum_discount_amount: None,
            created_at: now() - Duration::days(10),
            up_votes: &[],
            down_votes: &[],
        };
        // 0.4 * 0 + 0.4 * 0.5 + 0.2 * 0.6
        assert!(approx(score(&input, now()), 0.32));
    }

    #[test]
    fn test_vote_weights_decay_by_age() {
        assert_eq!(vote_weight(Duration::hours(23)), 1.0);
        assert_eq!(vote_weight(Duration::days(1)), 0.8);
        assert_eq!(vote_weight(Duration::days(6)), 0.8);
        assert_eq!(vote_weight(Duration::days(7)), 0.6);
        assert_eq!(vote_weight(Duration::days(29)), 0.6);
        assert_eq!(vote_weight(Duration::days(30)), 0.4);
        assert_eq!(vote_weight(Duration::days(179)), 0.4);
        assert_eq!(vote_weight(Duration::days(180)), 0.2);
        assert_eq!(vote_weight(Duration::seconds(-5)), 1.0);
    }

    #[test]
    fn test_freshness_buckets() {
        assert_eq!(freshness_component(Duration::zero()), 1.0);
        assert_eq!(freshness_component(Duration::days(3)), 0.8);
        assert_eq!(freshness_component(Duration::days(20)), 0.6);
        assert_eq!(freshness_component(Duration::days(60)), 0.4);
        assert_eq!(freshness_component(Duration::days(120)), 0.2);
        assert_eq!(freshness_component(Duration::days(400)), 0.1);
    }

    #[test]
    fn test_discount_component() {
        assert!(approx(discount_component(DiscountType::PercentageOff, 25.0, None), 0.25));
        assert!(approx(discount_component(DiscountType::PercentageOff, 150.0, None), 1.0));
        assert!(approx(discount_component(DiscountType::FixedAmount, 20.0, Some(80.0)), 0.25));
        assert!(approx(discount_component(DiscountType::FixedAmount, 200.0, Some(0.0)), 0.2));
        assert!(approx(discount_component(DiscountType::FixedAmount, 5000.0, None), 1.0));
        assert!(approx(discount_component(DiscountType::Bogo, 0.0, None), 0.5));
    }

    #[test]
    fn test_votes_net_out() {
        let now = now();
        let up = [now - Duration::hours(1), now - Duration::days(40)];
        let down = [now - Duration::days(3)];
        // (1.0 + 0.4) - 0.8
        assert!(approx(vote_component(&up, &down, now), 0.6));
    }

    #[test]
    fn test_score_is_deterministic() {
        let now = now();
        let up = [now - Duration::hours(2)];
        let input = ScoreInput {
            discount_type: DiscountType::PercentageOff,
            discount_value: 30.0,
            maximum_discount_amount: None,
            created_at: now - Duration::days(2),
            up_votes: &up,
            down_votes: &[],
        };
        let first = score(&input, now);
        let second = score(&input, now);
        assert_eq!(first, second);
        // 0.4 * 1.0 + 0.4 * 0.3 + 0.2 * 0.8
        assert!(approx(first, 0.68));
    }

    #[test]
    fn test_staleness() {
        let now = now();
        assert!(is_stale(None, now));
        assert!(!is_stale(Some(now - Duration::minutes(59)), now));
        assert!(is_stale(Some(now - Duration::minutes(61)), now));
    }
}

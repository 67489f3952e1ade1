use crate::error::LaunchError;
use serde::{Deserialize, Serialize};
use spotrun_common::{Offer, SelectionCriteria};
use std::cmp::Ordering;

/// How surviving offers are ordered. Both policies break ties by price, then offer id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RankingPolicy {
    /// Most reliable first. A non-zero `tolerance` groups reliabilities into buckets of
    /// that width, so offers within the same bucket compete on price.
    ReliabilityFirst { tolerance: f64 },
    /// `price_weight * max(0, 1 - price / max_price) + reliability_weight * reliability`,
    /// highest first.
    Weighted {
        price_weight: f64,
        reliability_weight: f64,
    },
}

impl Default for RankingPolicy {
    fn default() -> Self {
        RankingPolicy::ReliabilityFirst { tolerance: 0.0 }
    }
}

impl RankingPolicy {
    pub fn weighted_default() -> Self {
        RankingPolicy::Weighted {
            price_weight: 30.0,
            reliability_weight: 15.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RankingPolicy::ReliabilityFirst { .. } => "reliability-first",
            RankingPolicy::Weighted { .. } => "weighted",
        }
    }
}

/// Price and reliability limits. Offers with non-finite numbers never pass.
pub fn passes_limits(offer: &Offer, criteria: &SelectionCriteria) -> bool {
    offer.price_per_hour.is_finite()
        && offer.reliability.is_finite()
        && offer.price_per_hour >= 0.0
        && offer.price_per_hour <= criteria.max_price_per_hour
        && offer.reliability >= criteria.min_reliability
}

fn reliability_bucket(reliability: f64, tolerance: f64) -> f64 {
    if tolerance > 0.0 && tolerance.is_finite() {
        (reliability / tolerance).floor()
    } else {
        reliability
    }
}

fn weighted_score(offer: &Offer, max_price: f64, price_weight: f64, reliability_weight: f64) -> f64 {
    let price_term = if max_price > 0.0 {
        (1.0 - offer.price_per_hour / max_price).max(0.0)
    } else {
        0.0
    };
    price_weight * price_term + reliability_weight * offer.reliability
}

fn compare(a: &Offer, b: &Offer, criteria: &SelectionCriteria, policy: &RankingPolicy) -> Ordering {
    let primary = match *policy {
        RankingPolicy::ReliabilityFirst { tolerance } => {
            reliability_bucket(b.reliability, tolerance)
                .total_cmp(&reliability_bucket(a.reliability, tolerance))
        }
        RankingPolicy::Weighted {
            price_weight,
            reliability_weight,
        } => {
            let max = criteria.max_price_per_hour;
            weighted_score(b, max, price_weight, reliability_weight)
                .total_cmp(&weighted_score(a, max, price_weight, reliability_weight))
        }
    };
    primary
        .then_with(|| a.price_per_hour.total_cmp(&b.price_per_hour))
        .then_with(|| a.id.cmp(&b.id))
}

/// Filters by price / reliability limits and orders best first.
///
/// The result does not depend on the input order. Nothing left is `NoMatchingOffer`.
pub fn rank(
    offers: Vec<Offer>,
    criteria: &SelectionCriteria,
    policy: &RankingPolicy,
) -> Result<Vec<Offer>, LaunchError> {
    let mut ranked: Vec<Offer> = offers
        .into_iter()
        .filter(|o| passes_limits(o, criteria))
        .collect();
    if ranked.is_empty() {
        return Err(LaunchError::NoMatchingOffer);
    }
    ranked.sort_by(|a, b| compare(a, b, criteria, policy));
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotrun_providers::mock::mock_offer;

    fn ids(offers: &[Offer]) -> Vec<&str> {
        offers.iter().map(|o| o.id.as_str()).collect()
    }

    fn criteria(max_price: f64, min_rel: f64) -> SelectionCriteria {
        SelectionCriteria {
            max_price_per_hour: max_price,
            min_reliability: min_rel,
            ..SelectionCriteria::default()
        }
    }

    #[test]
    fn filters_and_prefers_reliability_then_price() {
        let offers = vec![
            mock_offer("A", "RTX 4090", 1.8, 0.96),
            mock_offer("B", "RTX 4090", 1.5, 0.99),
            mock_offer("C", "RTX 4090", 2.5, 0.99),
        ];
        let ranked = rank(offers, &criteria(2.0, 0.95), &RankingPolicy::default()).unwrap();
        assert_eq!(ids(&ranked), vec!["B", "A"]);
    }

    #[test]
    fn order_independent_of_input() {
        let offers = vec![
            mock_offer("d", "RTX 4090", 1.0, 0.97),
            mock_offer("b", "RTX 4090", 1.0, 0.97),
            mock_offer("c", "RTX 4090", 0.9, 0.97),
            mock_offer("a", "RTX 4090", 1.2, 0.98),
        ];
        let mut reversed = offers.clone();
        reversed.reverse();
        let c = criteria(2.0, 0.9);
        let policy = RankingPolicy::default();
        let r1 = rank(offers, &c, &policy).unwrap();
        let r2 = rank(reversed, &c, &policy).unwrap();
        assert_eq!(ids(&r1), vec!["a", "c", "b", "d"]);
        assert_eq!(ids(&r1), ids(&r2));
    }

    #[test]
    fn nothing_left_is_no_matching_offer() {
        let offers = vec![
            mock_offer("A", "RTX 4090", 3.0, 0.99),
            mock_offer("B", "RTX 4090", 1.0, 0.5),
        ];
        let err = rank(offers, &criteria(2.0, 0.9), &RankingPolicy::default()).unwrap_err();
        assert!(matches!(err, LaunchError::NoMatchingOffer));
        assert!(rank(vec![], &criteria(2.0, 0.9), &RankingPolicy::default()).is_err());
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let offers = vec![
            mock_offer("nan", "RTX 4090", f64::NAN, 0.99),
            mock_offer("inf", "RTX 4090", 1.0, f64::INFINITY),
            mock_offer("ok", "RTX 4090", 1.0, 0.95),
        ];
        let ranked = rank(offers, &criteria(2.0, 0.9), &RankingPolicy::default()).unwrap();
        assert_eq!(ids(&ranked), vec!["ok"]);
    }

    #[test]
    fn tolerance_buckets_compete_on_price() {
        let offers = vec![
            mock_offer("reliable", "RTX 4090", 1.9, 0.995),
            mock_offer("cheap", "RTX 4090", 1.1, 0.991),
        ];
        let c = criteria(2.0, 0.9);
        let strict = rank(offers.clone(), &c, &RankingPolicy::default()).unwrap();
        assert_eq!(ids(&strict), vec!["reliable", "cheap"]);

        let loose = rank(offers, &c, &RankingPolicy::ReliabilityFirst { tolerance: 0.01 }).unwrap();
        assert_eq!(ids(&loose), vec!["cheap", "reliable"]);
    }

    #[test]
    fn weighted_score_trades_price_for_reliability() {
        let offers = vec![
            mock_offer("pricey", "RTX 4090", 1.8, 0.99),
            mock_offer("cheap", "RTX 4090", 0.5, 0.92),
        ];
        // pricey: 30*0.1 + 15*0.99 = 17.85, cheap: 30*0.75 + 15*0.92 = 36.3
        let ranked = rank(offers, &criteria(2.0, 0.9), &RankingPolicy::weighted_default()).unwrap();
        assert_eq!(ids(&ranked), vec!["cheap", "pricey"]);
    }
}

use crate::error::LaunchError;
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use spotrun_common::gpu_filter::{gpu_name_matches, region_matches};
use spotrun_common::{Offer, SelectionCriteria};
use spotrun_providers::{Marketplace, MarketplaceError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Read-only view of the marketplace's current offers.
pub struct OfferCatalog {
    market: Arc<dyn Marketplace>,
    retry: RetryPolicy,
}

impl OfferCatalog {
    pub fn new(market: Arc<dyn Marketplace>, retry: RetryPolicy) -> Self {
        Self { market, retry }
    }

    /// Offers satisfying the hardware filters. No match is `Ok(vec![])`.
    ///
    /// Price and reliability limits are left to the ranker.
    pub async fn search(
        &self,
        criteria: &SelectionCriteria,
        cancel: &CancellationToken,
    ) -> Result<Vec<Offer>, LaunchError> {
        let market = self.market.as_ref();
        let offers = retry_with_backoff(
            &self.retry,
            "search offers",
            Some(cancel),
            MarketplaceError::is_transient,
            |_| market.search_offers(criteria),
        )
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => LaunchError::CatalogUnavailable {
                attempts,
                source: last,
            },
            RetryError::Permanent { error, .. } => LaunchError::Marketplace(error),
            RetryError::Cancelled => LaunchError::Cancelled,
        })?;

        let total = offers.len();
        let matching: Vec<Offer> = offers
            .into_iter()
            .filter(|o| matches_hardware(o, criteria))
            .collect();
        tracing::info!(
            "🔵 [catalog] {} offer(s) from {}, {} match hardware filters",
            total,
            self.market.name(),
            matching.len()
        );
        Ok(matching)
    }
}

/// GPU model, GPU count, region, disk and bandwidth. Offers already taken are dropped too.
pub fn matches_hardware(offer: &Offer, criteria: &SelectionCriteria) -> bool {
    offer.rentable
        && gpu_name_matches(&offer.gpu_name, &criteria.gpu_types)
        && offer.num_gpus == criteria.num_gpus
        && region_matches(offer.region.as_deref(), criteria.region.as_deref())
        && offer.disk_space_gb >= criteria.min_disk_gb
        && offer.inet_down_mbps >= criteria.min_inet_down_mbps
        && offer.inet_up_mbps >= criteria.min_inet_up_mbps
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotrun_providers::mock::{mock_offer, MockMarketplace};
    use std::time::Duration;

    fn criteria() -> SelectionCriteria {
        SelectionCriteria::default()
    }

    #[test]
    fn hardware_filters() {
        let c = criteria();
        assert!(matches_hardware(&mock_offer("1", "RTX 4090", 1.0, 0.99), &c));
        assert!(matches_hardware(&mock_offer("1", "rtx_4090", 1.0, 0.99), &c));
        assert!(!matches_hardware(&mock_offer("1", "RTX 3090", 1.0, 0.99), &c));

        let mut two_gpus = mock_offer("1", "RTX 4090", 1.0, 0.99);
        two_gpus.num_gpus = 2;
        assert!(!matches_hardware(&two_gpus, &c));

        let mut slow = mock_offer("1", "RTX 4090", 1.0, 0.99);
        slow.inet_up_mbps = 10.0;
        assert!(!matches_hardware(&slow, &c));

        let mut taken = mock_offer("1", "RTX 4090", 1.0, 0.99);
        taken.rentable = false;
        assert!(!matches_hardware(&taken, &c));

        let mut in_region = c.clone();
        in_region.region = Some("mockland".into());
        assert!(matches_hardware(&mock_offer("1", "RTX 4090", 1.0, 0.99), &in_region));
        in_region.region = Some("Norway".into());
        assert!(!matches_hardware(&mock_offer("1", "RTX 4090", 1.0, 0.99), &in_region));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalog_is_not_an_error() {
        let market = Arc::new(MockMarketplace::new(vec![]));
        let catalog = OfferCatalog::new(market, RetryPolicy::default());
        let offers = catalog
            .search(&criteria(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(offers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let market = Arc::new(
            MockMarketplace::new(vec![mock_offer("A", "RTX 4090", 1.0, 0.99)])
                .with_search_failures(2),
        );
        let catalog = OfferCatalog::new(market.clone(), RetryPolicy::default());
        let offers = catalog
            .search(&criteria(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(market.search_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_catalog_unavailable() {
        let market = Arc::new(MockMarketplace::new(vec![]).with_search_failures(10));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let catalog = OfferCatalog::new(market.clone(), policy);
        let err = catalog
            .search(&criteria(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::CatalogUnavailable { attempts: 3, .. }));
        assert_eq!(err.exit_code(), crate::error::exit_codes::CATALOG_UNAVAILABLE);
        assert_eq!(market.search_calls(), 3);
    }
}

use crate::error::LaunchError;
use crate::settings::MarketplaceSettings;
use spotrun_providers::Marketplace;
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    pub fn get_provider(settings: &MarketplaceSettings) -> Result<Arc<dyn Marketplace>, LaunchError> {
        match settings.provider.as_str() {
            #[cfg(feature = "provider-vastai")]
            "vastai" | "vast" => {
                let provider = spotrun_providers::vastai::VastAiProvider::new(
                    settings.api_key.clone(),
                    settings.base_url.clone(),
                )
                .map_err(|e| LaunchError::Config(format!("cannot build Vast.ai client: {}", e)))?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(mock_fixture())),
            other => Err(LaunchError::Config(format!(
                "unknown or disabled marketplace provider '{}'",
                other
            ))),
        }
    }
}

/// A small offline market for local dry runs: three hosts, the cheapest one unreliable.
#[cfg(feature = "provider-mock")]
fn mock_fixture() -> spotrun_providers::mock::MockMarketplace {
    use spotrun_common::{InstanceSnapshot, InstanceStatus};
    use spotrun_providers::mock::{mock_offer, MockMarketplace};

    MockMarketplace::new(vec![
        mock_offer("1001", "RTX 4090", 0.45, 0.995),
        mock_offer("1002", "RTX 4090", 0.38, 0.97),
        mock_offer("1003", "RTX 4090", 0.22, 0.81),
    ])
    .with_default_script(vec![
        InstanceSnapshot::status(InstanceStatus::Provisioning),
        InstanceSnapshot::status(InstanceStatus::Running),
        InstanceSnapshot::status(InstanceStatus::Running),
        InstanceSnapshot::exited(0),
    ])
    .with_logs(&["mock: epoch 1/1 done", "mock: training finished"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_config_error() {
        let settings = MarketplaceSettings {
            provider: "scaleway".into(),
            api_key: "k".into(),
            base_url: None,
        };
        assert!(matches!(
            ProviderManager::get_provider(&settings),
            Err(LaunchError::Config(_))
        ));
    }

    #[cfg(feature = "provider-vastai")]
    #[test]
    fn vastai_provider() {
        let settings = MarketplaceSettings {
            provider: "vastai".into(),
            api_key: "k".into(),
            base_url: None,
        };
        assert_eq!(ProviderManager::get_provider(&settings).unwrap().name(), "vastai");
    }
}

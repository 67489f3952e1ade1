use crate::error::LaunchError;
use crate::guard::{InstanceLease, TerminationGuard};
use crate::launch::LaunchSpec;
use crate::poll::{poll_until, PollError, PollSchedule, Probe};
use serde::{Deserialize, Serialize};
use spotrun_common::{Instance, InstanceStatus, Offer};
use spotrun_providers::{Marketplace, MarketplaceError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProvisionSettings {
    pub poll_interval: Duration,
    pub boot_timeout: Duration,
    /// Offers tried, best first, before giving up.
    pub max_offers: usize,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            boot_timeout: Duration::from_secs(600),
            max_offers: 3,
        }
    }
}

/// Why a single offer did not yield a running instance.
#[derive(Debug)]
pub enum AttemptError {
    /// Try the next offer.
    Skipped { reason: String },
    /// Stop the whole run.
    Fatal(LaunchError),
}

enum Boot {
    Running,
    /// Exited or vanished before we saw it running.
    Failed(String),
}

pub struct Provisioner {
    market: Arc<dyn Marketplace>,
    guard: Arc<TerminationGuard>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        market: Arc<dyn Marketplace>,
        guard: Arc<TerminationGuard>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            market,
            guard,
            settings,
        }
    }

    /// Creates an instance from `offer` and waits for it to run.
    ///
    /// The create call is not retried. The returned id is leased immediately; if the
    /// instance never reaches `running` the lease is released before returning.
    pub async fn provision(
        &self,
        offer: &Offer,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<InstanceLease, AttemptError> {
        if cancel.is_cancelled() {
            return Err(AttemptError::Fatal(LaunchError::Cancelled));
        }
        let request = spec.request_for(offer);
        tracing::info!(
            "🔵 [provisioner] creating instance from offer {} ({} x{} @ ${:.3}/h)",
            offer.id,
            offer.gpu_name,
            offer.num_gpus,
            offer.price_per_hour
        );

        let instance_id = match self.market.create_instance(&request).await {
            Ok(id) => id,
            Err(e) => {
                if e.is_transient() {
                    // The marketplace may have accepted the request before the connection failed.
                    self.reap_orphans(&spec.label).await?;
                }
                return match e {
                    MarketplaceError::Transient(_)
                    | MarketplaceError::Rejected { .. }
                    | MarketplaceError::NotFound(_) => Err(AttemptError::Skipped {
                        reason: format!("create failed for offer {}: {}", offer.id, e),
                    }),
                    other => Err(AttemptError::Fatal(LaunchError::Marketplace(other))),
                };
            }
        };

        let mut lease = self.guard.lease(Instance::new(instance_id.clone(), offer.id.clone()));
        tracing::info!(
            "✅ [provisioner] instance {} created, waiting up to {:?} for it to run",
            instance_id,
            self.settings.boot_timeout
        );

        let schedule = PollSchedule {
            interval: self.settings.poll_interval,
            timeout: self.settings.boot_timeout,
        };
        let market = self.market.as_ref();
        let id = instance_id.as_str();
        let booted = poll_until(schedule, cancel, move |_| async move {
            match market.get_instance(id).await {
                // An exit code means the job already ran, whatever the status says. The
                // monitor reports it; another offer must not run the job again.
                Ok(snap) if snap.exit_code.is_some() => Ok(Probe::Ready(Boot::Running)),
                Ok(snap) => match snap.status {
                    InstanceStatus::Running => Ok(Probe::Ready(Boot::Running)),
                    // Finished before the first poll saw it running.
                    InstanceStatus::Succeeded => Ok(Probe::Ready(Boot::Running)),
                    InstanceStatus::Failed | InstanceStatus::Lost | InstanceStatus::Destroyed => {
                        Ok(Probe::Ready(Boot::Failed(format!(
                            "status {}{}",
                            snap.status,
                            snap.message
                                .map(|m| format!(" ({})", m))
                                .unwrap_or_default()
                        ))))
                    }
                    InstanceStatus::Provisioning => Ok(Probe::Pending),
                },
                Err(e) if e.is_transient() => {
                    tracing::warn!("⚠️ [provisioner] status poll for {} failed: {}", id, e);
                    Ok(Probe::Pending)
                }
                Err(e) if e.is_not_found() => {
                    Ok(Probe::Ready(Boot::Failed("instance disappeared".to_string())))
                }
                Err(e) => Err(e),
            }
        })
        .await;

        let failure = match booted {
            Ok(Boot::Running) => {
                lease.instance_mut().status = InstanceStatus::Running;
                tracing::info!("✅ [provisioner] instance {} is running", instance_id);
                return Ok(lease);
            }
            Ok(Boot::Failed(reason)) => AttemptError::Skipped {
                reason: format!("instance {} failed to boot: {}", instance_id, reason),
            },
            Err(PollError::TimedOut(budget)) => AttemptError::Skipped {
                reason: format!("instance {} not running after {:?}", instance_id, budget),
            },
            Err(PollError::Cancelled) => AttemptError::Fatal(LaunchError::Cancelled),
            Err(PollError::Failed(e)) => AttemptError::Fatal(LaunchError::Marketplace(e)),
        };

        tracing::warn!("⚠️ [provisioner] abandoning instance {}", instance_id);
        if let Err(e) = lease.release().await {
            return Err(AttemptError::Fatal(e));
        }
        Err(failure)
    }

    /// Tries `ranked` offers in order until one runs, at most `max_offers` of them.
    pub async fn provision_first_available(
        &self,
        ranked: &[Offer],
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<(Offer, InstanceLease), LaunchError> {
        if ranked.is_empty() {
            return Err(LaunchError::NoMatchingOffer);
        }
        let candidates = &ranked[..ranked.len().min(self.settings.max_offers.max(1))];
        let mut last_error = String::new();
        for (i, offer) in candidates.iter().enumerate() {
            match self.provision(offer, spec, cancel).await {
                Ok(lease) => return Ok((offer.clone(), lease)),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Skipped { reason }) => {
                    tracing::warn!(
                        "⚠️ [provisioner] attempt {}/{} failed: {}",
                        i + 1,
                        candidates.len(),
                        reason
                    );
                    last_error = reason;
                }
            }
        }
        Err(LaunchError::ProvisioningExhausted {
            attempts: candidates.len(),
            last_error,
        })
    }

    /// Destroys live instances carrying this run's label.
    async fn reap_orphans(&self, label: &str) -> Result<(), AttemptError> {
        let instances = match self.market.list_instances().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(
                    "⚠️ [provisioner] could not list instances to check for orphans: {}",
                    e
                );
                return Ok(());
            }
        };
        for inst in instances
            .iter()
            .filter(|i| i.label.as_deref() == Some(label))
        {
            if self.guard.is_destroyed(&inst.id).await {
                continue;
            }
            tracing::warn!("⚠️ [provisioner] destroying orphan instance {}", inst.id);
            self.guard
                .ensure_destroyed(&inst.id)
                .await
                .map_err(AttemptError::Fatal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::Secrets;
    use crate::retry::RetryPolicy;
    use spotrun_common::InstanceSnapshot;
    use spotrun_providers::mock::{mock_offer, MockMarketplace};

    fn spec() -> LaunchSpec {
        LaunchSpec {
            image: "img".into(),
            disk_gb: 50.0,
            config_path: "config.yaml".into(),
            entrypoint: vec!["train".into()],
            extra_args: vec![],
            data_dir: "/data".into(),
            secrets: Secrets::default(),
            label: "spotrun-test".into(),
            api_url: "http://localhost".into(),
        }
    }

    fn provisioner(market: Arc<MockMarketplace>) -> Provisioner {
        let guard = Arc::new(TerminationGuard::new(market.clone(), RetryPolicy::default()));
        Provisioner::new(market, guard, ProvisionSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_running() {
        let market = Arc::new(
            MockMarketplace::new(vec![mock_offer("A", "RTX 4090", 1.0, 0.99)]).with_status_script(
                "A",
                vec![
                    InstanceSnapshot::status(InstanceStatus::Provisioning),
                    InstanceSnapshot::status(InstanceStatus::Provisioning),
                    InstanceSnapshot::status(InstanceStatus::Running),
                ],
            ),
        );
        let p = provisioner(market.clone());
        let offer = mock_offer("A", "RTX 4090", 1.0, 0.99);
        let lease = p
            .provision(&offer, &spec(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lease.instance().status, InstanceStatus::Running);
        assert_eq!(market.get_calls(), 3);
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_boot_releases_and_skips() {
        let market = Arc::new(
            MockMarketplace::new(vec![mock_offer("A", "RTX 4090", 1.0, 0.99)])
                .with_status_script(
                    "A",
                    vec![InstanceSnapshot::status(InstanceStatus::Failed).with_message("pull failed")],
                ),
        );
        let p = provisioner(market.clone());
        let offer = mock_offer("A", "RTX 4090", 1.0, 0.99);
        let err = p
            .provision(&offer, &spec(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::Skipped { ref reason } if reason.contains("pull failed")));
        assert!(market.live_instances().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn early_exit_code_counts_as_booted() {
        let market = Arc::new(
            MockMarketplace::new(vec![mock_offer("A", "RTX 4090", 1.0, 0.99)])
                .with_status_script("A", vec![InstanceSnapshot::exited(2)]),
        );
        let p = provisioner(market.clone());
        let lease = p
            .provision(&mock_offer("A", "RTX 4090", 1.0, 0.99), &spec(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(market.destroy_calls().is_empty());
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_create_skips_without_lease() {
        let market = Arc::new(
            MockMarketplace::new(vec![mock_offer("A", "RTX 4090", 1.0, 0.99)])
                .with_rejected_offer("A"),
        );
        let p = provisioner(market.clone());
        let err = p
            .provision(&mock_offer("A", "RTX 4090", 1.0, 0.99), &spec(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::Skipped { .. }));
        assert!(market.destroy_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn max_offers_bounds_attempts() {
        let offers: Vec<Offer> = (1..=5)
            .map(|i| mock_offer(&format!("O{}", i), "RTX 4090", 1.0, 0.99))
            .collect();
        let mut market = MockMarketplace::new(offers.clone());
        for o in &offers {
            market = market.with_rejected_offer(&o.id);
        }
        let market = Arc::new(market);
        let p = provisioner(market.clone());
        let err = p
            .provision_first_available(&offers, &spec(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::ProvisioningExhausted { attempts: 3, .. }));
        assert_eq!(market.create_calls(), 3);
    }
}

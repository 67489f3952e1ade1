use crate::alert::Alerter;
use crate::catalog::OfferCatalog;
use crate::error::{exit_codes, outcome_exit_code, LaunchError};
use crate::guard::TerminationGuard;
use crate::image;
use crate::monitor::LifecycleMonitor;
use crate::provisioner::Provisioner;
use crate::ranker;
use crate::settings::{Mode, Settings};
use spotrun_common::report::{estimate_cost, RunPhase, RunReport};
use spotrun_common::{InstanceSummary, Offer, RunOutcome};
use spotrun_providers::Marketplace;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a run ended with. Always produced, whatever failed.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub phase: RunPhase,
    pub exit_code: i32,
    pub selected: Option<Offer>,
    pub instance_id: Option<String>,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
    pub estimated_cost_usd: Option<f64>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            phase: RunPhase::Aborted,
            exit_code: exit_codes::SUCCESS,
            selected: None,
            instance_id: None,
            outcome: None,
            error: None,
            estimated_cost_usd: None,
        }
    }

    fn fail(&mut self, e: &LaunchError) {
        self.exit_code = e.exit_code();
        self.error = Some(e.to_string());
    }
}

pub fn describe_offer(offer: &Offer) -> String {
    format!(
        "offer {}: {} x{} ({:.0} GB VRAM) ${:.3}/h, reliability {:.1}%, down {:.0} / up {:.0} Mbps, {}",
        offer.id,
        offer.gpu_name,
        offer.num_gpus,
        offer.gpu_ram_gb,
        offer.price_per_hour,
        offer.reliability * 100.0,
        offer.inet_down_mbps,
        offer.inet_up_mbps,
        offer.region.as_deref().unwrap_or("unknown location")
    )
}

pub struct Pipeline {
    settings: Settings,
    market: Arc<dyn Marketplace>,
    guard: Arc<TerminationGuard>,
    alerter: Alerter,
}

impl Pipeline {
    pub fn new(settings: Settings, market: Arc<dyn Marketplace>) -> Self {
        let guard = Arc::new(TerminationGuard::new(
            market.clone(),
            settings.destroy_retry,
        ));
        let alerter = Alerter::new(settings.alert.clone());
        Self {
            settings,
            market,
            guard,
            alerter,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>, LaunchError> {
        Ok(self.market.list_instances().await?)
    }

    /// Runs selection, and unless this is a dry run, provisioning, training and teardown.
    pub async fn run(&self, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::new();
        tracing::info!(
            "🔵 [pipeline] run {} on {} ({:?})",
            self.settings.run_id,
            self.market.name(),
            self.settings.mode
        );

        if let Err(e) = self.execute(cancel, &mut summary).await {
            if let LaunchError::TerminationFailed { instance_id, .. } = &e {
                self.alerter
                    .termination_failed(instance_id, &e.to_string())
                    .await;
            }
            if e.is_expected() {
                tracing::warn!("⚠️ [pipeline] {}", e);
            } else {
                tracing::error!("❌ [pipeline] {}", e);
            }
            summary.fail(&e);
        }

        if let (Some(offer), Some(outcome)) = (&summary.selected, &summary.outcome) {
            let cost = estimate_cost(offer, outcome);
            summary.estimated_cost_usd = Some(cost);
            tracing::info!(
                "[pipeline] estimated compute cost ${:.2} ({:.0}s at ${:.3}/h)",
                cost,
                outcome.elapsed_secs,
                offer.price_per_hour
            );
        }
        tracing::info!(
            "[pipeline] run {} finished: {} exit_code={}",
            self.settings.run_id,
            summary.phase.as_str(),
            summary.exit_code
        );
        summary
    }

    async fn select(&self, cancel: &CancellationToken) -> Result<Vec<Offer>, LaunchError> {
        let catalog = OfferCatalog::new(self.market.clone(), self.settings.catalog_retry);
        let offers = catalog.search(&self.settings.criteria, cancel).await?;
        let ranked = ranker::rank(offers, &self.settings.criteria, &self.settings.ranking)?;
        tracing::info!(
            "✅ [pipeline] {} offer(s) ranked by {}, best {}",
            ranked.len(),
            self.settings.ranking.name(),
            describe_offer(&ranked[0])
        );
        Ok(ranked)
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), LaunchError> {
        if self.settings.mode == Mode::DryRun {
            let ranked = self.select(cancel).await?;
            println!("[DRY RUN] would launch {}", describe_offer(&ranked[0]));
            summary.selected = ranked.into_iter().next();
            summary.phase = RunPhase::DryRun;
            return Ok(());
        }

        image::build_and_push(&self.settings.image).await?;
        if cancel.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }

        let ranked = self.select(cancel).await?;
        let provisioner = Provisioner::new(
            self.market.clone(),
            self.guard.clone(),
            self.settings.provision,
        );
        let (offer, lease) = provisioner
            .provision_first_available(&ranked, &self.settings.launch, cancel)
            .await?;
        summary.selected = Some(offer);
        summary.instance_id = Some(lease.id().to_string());

        let monitor = LifecycleMonitor::new(self.market.clone(), self.settings.monitor);
        let guard = self.guard.clone();
        let has_wandb_key = self.settings.launch.secrets.has_wandb_key();
        let scoped = lease
            .scope(|instance| async move {
                if !has_wandb_key {
                    // Training must not start without experiment tracking.
                    tracing::error!("❌ [pipeline] WANDB_API_KEY is not set, not starting training");
                    if let Err(e) = guard.ensure_destroyed(&instance.id).await {
                        return Err(e);
                    }
                    return Err(LaunchError::MissingCredential("WANDB_API_KEY"));
                }
                monitor.await_completion(&instance, cancel).await
            })
            .await;

        // A failed destroy outranks whatever the run itself produced.
        let outcome = match scoped.result {
            Ok(outcome) => outcome,
            Err(e) => {
                scoped.termination?;
                return Err(e);
            }
        };
        summary.exit_code = outcome_exit_code(&outcome, self.settings.monitor.run_timeout);
        if let Some(e) = LaunchError::from_outcome(&outcome, self.settings.monitor.run_timeout) {
            summary.error = Some(e.to_string());
        }
        summary.phase = RunPhase::Completed;
        summary.outcome = Some(outcome);
        scoped.termination
    }

    pub fn to_report(&self, summary: &RunSummary) -> RunReport {
        let mut report = RunReport::new(
            self.settings.run_id,
            summary.phase.clone(),
            summary.exit_code,
            self.market.name(),
        );
        report.selected_offer = summary.selected.clone();
        report.outcome = summary.outcome.clone();
        report.error = summary.error.clone();
        report.estimated_cost_usd = summary.estimated_cost_usd;
        report
    }
}

use crate::error::LaunchError;
use crate::poll::{poll_until, PollError, PollSchedule, Probe};
use serde::{Deserialize, Serialize};
use spotrun_common::{Instance, InstanceSnapshot, InstanceStatus, OutcomeKind, RunOutcome};
use spotrun_providers::Marketplace;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Wall-clock budget for the whole training run.
    pub run_timeout: Duration,
    /// Lines requested per log poll; 0 disables log forwarding.
    pub log_tail_lines: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(24 * 3600),
            log_tail_lines: 50,
        }
    }
}

pub struct LifecycleMonitor {
    market: Arc<dyn Marketplace>,
    settings: MonitorSettings,
    /// Last log line forwarded, so overlapping tails are not printed twice.
    last_log_line: Mutex<Option<String>>,
}

fn outcome_for(snap: &InstanceSnapshot) -> Option<OutcomeKind> {
    match (snap.status, snap.exit_code) {
        (_, Some(0)) => Some(OutcomeKind::Succeeded),
        (InstanceStatus::Succeeded | InstanceStatus::Failed, Some(code)) => {
            Some(OutcomeKind::Failed { exit_code: code })
        }
        (InstanceStatus::Succeeded, None) => Some(OutcomeKind::Succeeded),
        (InstanceStatus::Failed, None) => Some(OutcomeKind::Failed { exit_code: 1 }),
        (InstanceStatus::Lost | InstanceStatus::Destroyed, _) => Some(OutcomeKind::Lost {
            reason: snap
                .message
                .clone()
                .unwrap_or_else(|| format!("marketplace reports {}", snap.status)),
        }),
        (InstanceStatus::Provisioning | InstanceStatus::Running, Some(code)) => {
            Some(OutcomeKind::Failed { exit_code: code })
        }
        (InstanceStatus::Provisioning | InstanceStatus::Running, None) => None,
    }
}

impl LifecycleMonitor {
    pub fn new(market: Arc<dyn Marketplace>, settings: MonitorSettings) -> Self {
        Self {
            market,
            settings,
            last_log_line: Mutex::new(None),
        }
    }

    /// Polls `instance` until it finishes, vanishes or runs out of time.
    ///
    /// Never retries the job. Transient poll errors are logged and polling continues
    /// within the budget; any other marketplace error is returned.
    pub async fn await_completion(
        &self,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, LaunchError> {
        let started = Instant::now();
        let schedule = PollSchedule {
            interval: self.settings.poll_interval,
            timeout: self.settings.run_timeout,
        };
        tracing::info!(
            "🔵 [monitor] watching instance {} (poll every {:?}, budget {:?})",
            instance.id,
            schedule.interval,
            schedule.timeout
        );

        let this = self;
        let id = instance.id.as_str();
        let res = poll_until(schedule, cancel, move |_| this.probe(id)).await;

        let result = match res {
            Ok(kind) => kind,
            Err(PollError::TimedOut(budget)) => {
                tracing::warn!(
                    "⚠️ [monitor] instance {} still running after {:?}",
                    instance.id,
                    budget
                );
                OutcomeKind::TimedOut
            }
            Err(PollError::Cancelled) => return Err(LaunchError::Cancelled),
            Err(PollError::Failed(e)) => return Err(LaunchError::Marketplace(e)),
        };

        let outcome = RunOutcome::new(instance.id.clone(), result, started.elapsed());
        tracing::info!(
            "✅ [monitor] instance {} finished: {} after {:.0}s",
            instance.id,
            outcome.result,
            outcome.elapsed_secs
        );
        Ok(outcome)
    }

    async fn probe(
        &self,
        instance_id: &str,
    ) -> Result<Probe<OutcomeKind>, spotrun_providers::MarketplaceError> {
        let snap = match self.market.get_instance(instance_id).await {
            Ok(snap) => snap,
            Err(e) if e.is_not_found() => {
                return Ok(Probe::Ready(OutcomeKind::Lost {
                    reason: "instance no longer exists".to_string(),
                }))
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("⚠️ [monitor] status poll for {} failed: {}", instance_id, e);
                return Ok(Probe::Pending);
            }
            Err(e) => return Err(e),
        };

        self.forward_logs(instance_id).await;

        match outcome_for(&snap) {
            Some(kind) => Ok(Probe::Ready(kind)),
            None => {
                tracing::debug!("[monitor] instance {} is {}", instance_id, snap.status);
                Ok(Probe::Pending)
            }
        }
    }

    async fn forward_logs(&self, instance_id: &str) {
        if self.settings.log_tail_lines == 0 {
            return;
        }
        let lines = match self
            .market
            .tail_logs(instance_id, self.settings.log_tail_lines)
            .await
        {
            Ok(Some(lines)) => lines,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("[monitor] log tail for {} failed: {}", instance_id, e);
                return;
            }
        };

        let mut last = self.last_log_line.lock().unwrap_or_else(|e| e.into_inner());
        let start = last
            .as_ref()
            .and_then(|prev| lines.iter().rposition(|l| l == prev))
            .map(|i| i + 1)
            .unwrap_or(0);
        for line in &lines[start..] {
            tracing::info!("[train {}] {}", instance_id, line);
        }
        if let Some(l) = lines.last() {
            *last = Some(l.clone());
        }
    }
}

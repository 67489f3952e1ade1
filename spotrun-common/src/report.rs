use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Offer, RunOutcome};

// -----------------------------------------------------------------------------
// Run report (written with --report, consumed by CI)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum RunPhase {
    #[serde(rename = "RUN:DRY_RUN")]
    DryRun,
    #[serde(rename = "RUN:COMPLETED")]
    Completed,
    #[serde(rename = "RUN:ABORTED")]
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::DryRun => "RUN:DRY_RUN",
            RunPhase::Completed => "RUN:COMPLETED",
            RunPhase::Aborted => "RUN:ABORTED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub finished_at: DateTime<Utc>,
    pub selected_offer: Option<Offer>,
    pub outcome: Option<RunOutcome>,
    /// Set when the run stopped before (or instead of) producing an outcome.
    pub error: Option<String>,
    pub exit_code: i32,
    pub estimated_cost_usd: Option<f64>,
    pub source: String,
}

impl RunReport {
    pub fn new(run_id: Uuid, phase: RunPhase, exit_code: i32, source: &str) -> Self {
        Self {
            run_id,
            phase,
            finished_at: Utc::now(),
            selected_offer: None,
            outcome: None,
            error: None,
            exit_code,
            estimated_cost_usd: None,
            source: source.to_string(),
        }
    }
}

/// Price × wall-clock time, in USD. Marketplaces bill per second, so this is close
/// to the invoice for the compute part (storage and bandwidth excluded).
pub fn estimate_cost(offer: &Offer, outcome: &RunOutcome) -> f64 {
    let hours = outcome.elapsed_secs.max(0.0) / 3600.0;
    offer.price_per_hour * hours
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutcomeKind;
    use std::time::Duration;

    #[test]
    fn phase_serializes_with_prefix() {
        let v = serde_json::to_value(RunPhase::Completed).unwrap();
        assert_eq!(v, serde_json::json!("RUN:COMPLETED"));
        assert_eq!(RunPhase::DryRun.as_str(), "RUN:DRY_RUN");
    }

    #[test]
    fn cost_is_price_times_hours() {
        let offer = Offer {
            id: "1".into(),
            gpu_name: "RTX 4090".into(),
            num_gpus: 1,
            price_per_hour: 1.5,
            reliability: 0.99,
            region: None,
            disk_space_gb: 100.0,
            inet_down_mbps: 500.0,
            inet_up_mbps: 500.0,
            gpu_ram_gb: 24.0,
            rentable: true,
        };
        let outcome = RunOutcome::new("9", OutcomeKind::Succeeded, Duration::from_secs(7200));
        assert!((estimate_cost(&offer, &outcome) - 3.0).abs() < 1e-9);
    }
}

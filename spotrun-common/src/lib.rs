use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod gpu_filter;
pub mod report;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning, // Create accepted, machine not up yet
    Running,      // Container is running
    Succeeded,    // Container exited 0
    Failed,       // Container exited non-zero (or failed to start)
    Lost,         // Reclaimed / vanished on the marketplace side
    Destroyed,    // Destroy confirmed
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Lost => "lost",
            InstanceStatus::Destroyed => "destroyed",
        }
    }

    /// No further transition is expected from the marketplace.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded
                | InstanceStatus::Failed
                | InstanceStatus::Lost
                | InstanceStatus::Destroyed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown instance status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for InstanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provisioning" => Ok(InstanceStatus::Provisioning),
            "running" => Ok(InstanceStatus::Running),
            "succeeded" => Ok(InstanceStatus::Succeeded),
            "failed" => Ok(InstanceStatus::Failed),
            "lost" => Ok(InstanceStatus::Lost),
            "destroyed" => Ok(InstanceStatus::Destroyed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// --- Marketplace snapshots ---

/// One advertised, not-yet-leased machine configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Offer {
    pub id: String,
    pub gpu_name: String,
    pub num_gpus: u32,
    pub price_per_hour: f64,
    /// Historical uptime in [0, 1].
    pub reliability: f64,
    pub region: Option<String>,
    pub disk_space_gb: f64,
    pub inet_down_mbps: f64,
    pub inet_up_mbps: f64,
    pub gpu_ram_gb: f64,
    pub rentable: bool,
}

/// User constraints for a run. Built once from the command line.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SelectionCriteria {
    /// Case-insensitive substrings; an offer matches if any of them occurs in its GPU name.
    pub gpu_types: Vec<String>,
    pub max_price_per_hour: f64,
    pub min_reliability: f64,
    pub region: Option<String>,
    pub num_gpus: u32,
    pub min_disk_gb: f64,
    pub min_inet_down_mbps: f64,
    pub min_inet_up_mbps: f64,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            gpu_types: vec!["RTX 4090".to_string()],
            max_price_per_hour: 2.0,
            min_reliability: 0.9,
            region: None,
            num_gpus: 1,
            min_disk_gb: 50.0,
            min_inet_down_mbps: 100.0,
            min_inet_up_mbps: 100.0,
        }
    }
}

/// Everything the marketplace needs to create one instance from one offer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LaunchRequest {
    pub offer_id: String,
    pub image: String,
    pub disk_gb: f64,
    pub onstart: String,
    pub env: BTreeMap<String, String>,
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub offer_id: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: impl Into<String>, offer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            offer_id: offer_id.into(),
            status: InstanceStatus::Provisioning,
            created_at: Utc::now(),
        }
    }
}

/// Result of a single status poll.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub status: InstanceStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl InstanceSnapshot {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status,
            exit_code: None,
            message: None,
        }
    }

    pub fn exited(exit_code: i32) -> Self {
        let status = if exit_code == 0 {
            InstanceStatus::Succeeded
        } else {
            InstanceStatus::Failed
        };
        Self {
            status,
            exit_code: Some(exit_code),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Listing entry for `--list`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceSummary {
    pub id: String,
    pub gpu_name: Option<String>,
    pub price_per_hour: Option<f64>,
    pub status: String,
    pub label: Option<String>,
}

// --- Outcome ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Failed { exit_code: i32 },
    Lost { reason: String },
    TimedOut,
}

impl OutcomeKind {
    /// Exit code of the training process, when it is known.
    pub fn training_exit_code(&self) -> Option<i32> {
        match self {
            OutcomeKind::Succeeded => Some(0),
            OutcomeKind::Failed { exit_code } => Some(*exit_code),
            OutcomeKind::Lost { .. } | OutcomeKind::TimedOut => None,
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Succeeded => write!(f, "succeeded"),
            OutcomeKind::Failed { exit_code } => write!(f, "failed({})", exit_code),
            OutcomeKind::Lost { reason } => write!(f, "lost ({})", reason),
            OutcomeKind::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunOutcome {
    pub instance_id: String,
    pub result: OutcomeKind,
    pub elapsed_secs: f64,
}

impl RunOutcome {
    pub fn new(instance_id: impl Into<String>, result: OutcomeKind, elapsed: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            result,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs.max(0.0))
    }
}

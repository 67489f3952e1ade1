use spotrun_common::{OutcomeKind, RunOutcome};
use spotrun_providers::MarketplaceError;
use std::time::Duration;

/// Process exit codes reserved for infrastructure outcomes, so CI can tell
/// "training failed" (the training exit code) from "the launcher failed".
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG: i32 = 64;
    pub const MISSING_CREDENTIAL: i32 = 65;
    pub const NO_MATCHING_OFFER: i32 = 69;
    pub const CATALOG_UNAVAILABLE: i32 = 70;
    pub const PROVISIONING_EXHAUSTED: i32 = 71;
    pub const INSTANCE_LOST: i32 = 72;
    pub const RUN_TIMED_OUT: i32 = 73;
    pub const IMAGE: i32 = 74;
    pub const MARKETPLACE: i32 = 75;
    pub const TERMINATION_FAILED: i32 = 100;
    pub const CANCELLED: i32 = 130;
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("missing credential {0}")]
    MissingCredential(&'static str),

    #[error("offer catalog unavailable after {attempts} attempt(s): {source}")]
    CatalogUnavailable {
        attempts: u32,
        #[source]
        source: MarketplaceError,
    },

    #[error("no offer matches the selection criteria")]
    NoMatchingOffer,

    #[error("provisioning exhausted after {attempts} offer(s), last error: {last_error}")]
    ProvisioningExhausted { attempts: usize, last_error: String },

    #[error("instance {instance_id} lost: {reason}")]
    InstanceLost { instance_id: String, reason: String },

    #[error("instance {instance_id} did not finish within {budget:?}")]
    RunTimedOut { instance_id: String, budget: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("image step failed: {0}")]
    Image(String),

    #[error(transparent)]
    Marketplace(#[from] MarketplaceError),

    #[error("failed to destroy instance {instance_id} after {attempts} attempt(s): {last_error}")]
    TerminationFailed {
        instance_id: String,
        attempts: u32,
        last_error: String,
    },
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Config(_) => exit_codes::CONFIG,
            LaunchError::MissingCredential(_) => exit_codes::MISSING_CREDENTIAL,
            LaunchError::CatalogUnavailable { .. } => exit_codes::CATALOG_UNAVAILABLE,
            LaunchError::NoMatchingOffer => exit_codes::NO_MATCHING_OFFER,
            LaunchError::ProvisioningExhausted { .. } => exit_codes::PROVISIONING_EXHAUSTED,
            LaunchError::InstanceLost { .. } => exit_codes::INSTANCE_LOST,
            LaunchError::RunTimedOut { .. } => exit_codes::RUN_TIMED_OUT,
            LaunchError::Cancelled => exit_codes::CANCELLED,
            LaunchError::Image(_) => exit_codes::IMAGE,
            LaunchError::Marketplace(_) => exit_codes::MARKETPLACE,
            LaunchError::TerminationFailed { .. } => exit_codes::TERMINATION_FAILED,
        }
    }

    /// Expected terminal conditions, as opposed to infrastructure faults.
    pub fn is_expected(&self) -> bool {
        matches!(self, LaunchError::NoMatchingOffer | LaunchError::Cancelled)
    }

    /// Outcomes where training never reported an exit code become errors.
    pub fn from_outcome(outcome: &RunOutcome, run_timeout: Duration) -> Option<LaunchError> {
        match &outcome.result {
            OutcomeKind::Succeeded | OutcomeKind::Failed { .. } => None,
            OutcomeKind::Lost { reason } => Some(LaunchError::InstanceLost {
                instance_id: outcome.instance_id.clone(),
                reason: reason.clone(),
            }),
            OutcomeKind::TimedOut => Some(LaunchError::RunTimedOut {
                instance_id: outcome.instance_id.clone(),
                budget: run_timeout,
            }),
        }
    }
}

/// Exit code for a finished run: the training exit code when training reported one.
pub fn outcome_exit_code(outcome: &RunOutcome, run_timeout: Duration) -> i32 {
    match outcome.result.training_exit_code() {
        // A non-zero code must stay non-zero after the OS truncates it to 8 bits.
        Some(code) if code != 0 && code & 0xff == 0 => 1,
        Some(code) => code,
        None => LaunchError::from_outcome(outcome, run_timeout)
            .map(|e| e.exit_code())
            .unwrap_or(exit_codes::SUCCESS),
    }
}

use async_trait::async_trait;
use spotrun_common::{
    InstanceSnapshot, InstanceSummary, LaunchRequest, Offer, SelectionCriteria,
};

#[derive(Debug, thiserror::Error)]
pub enum MarketplaceError {
    /// Network failure, timeout, 429 or 5xx. Safe to retry.
    #[error("marketplace unavailable: {0}")]
    Transient(String),
    #[error("marketplace rejected request: status={status} body={body}")]
    Rejected { status: u16, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MarketplaceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MarketplaceError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MarketplaceError::NotFound(_))
    }

    /// Classify an HTTP status + body returned by a marketplace API.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 => MarketplaceError::NotFound(body),
            429 | 500..=599 => MarketplaceError::Transient(format!("status={} body={}", status, body)),
            _ => MarketplaceError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for MarketplaceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return MarketplaceError::Transient(e.to_string());
        }
        if let Some(status) = e.status() {
            return MarketplaceError::from_status(status.as_u16(), e.to_string());
        }
        MarketplaceError::Other(anyhow::Error::new(e))
    }
}

pub type MarketResult<T> = Result<T, MarketplaceError>;

/// A spot GPU marketplace. Every call is a single bounded request; retry policy belongs
/// to the caller.
#[async_trait]
pub trait Marketplace: Send + Sync {
    fn name(&self) -> &'static str;

    /// Offers currently for rent. `criteria` may be pushed down to the API as a hint;
    /// callers still filter the result themselves.
    async fn search_offers(&self, criteria: &SelectionCriteria) -> MarketResult<Vec<Offer>>;

    /// Rent `request.offer_id` and start the container. Returns the instance id.
    /// Not idempotent: a retry may rent a second machine.
    async fn create_instance(&self, request: &LaunchRequest) -> MarketResult<String>;

    async fn get_instance(&self, instance_id: &str) -> MarketResult<InstanceSnapshot>;

    /// Destroy the instance. An already-gone instance is reported as `NotFound`.
    async fn destroy_instance(&self, instance_id: &str) -> MarketResult<()>;

    // Optional: last lines of the container log.
    // Default implementation returns None (provider cannot stream logs).
    async fn tail_logs(
        &self,
        _instance_id: &str,
        _max_lines: usize,
    ) -> MarketResult<Option<Vec<String>>> {
        Ok(None)
    }

    // For --list
    async fn list_instances(&self) -> MarketResult<Vec<InstanceSummary>>;
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "vastai")]
pub mod vastai;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(MarketplaceError::from_status(503, "down".into()).is_transient());
        assert!(MarketplaceError::from_status(429, "slow down".into()).is_transient());
        assert!(MarketplaceError::from_status(404, "gone".into()).is_not_found());
        let rejected = MarketplaceError::from_status(400, "bad".into());
        assert!(!rejected.is_transient());
        assert!(matches!(rejected, MarketplaceError::Rejected { status: 400, .. }));
    }
}

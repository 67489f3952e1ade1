use crate::error::LaunchError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use futures_util::FutureExt;
use spotrun_common::Instance;
use spotrun_providers::{Marketplace, MarketplaceError};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Destroys instances, at most once each.
pub struct TerminationGuard {
    market: Arc<dyn Marketplace>,
    retry: RetryPolicy,
    destroyed: Mutex<HashSet<String>>,
}

impl TerminationGuard {
    pub fn new(market: Arc<dyn Marketplace>, retry: RetryPolicy) -> Self {
        Self {
            market,
            retry,
            destroyed: Mutex::new(HashSet::new()),
        }
    }

    pub async fn is_destroyed(&self, instance_id: &str) -> bool {
        self.destroyed.lock().await.contains(instance_id)
    }

    /// Requests destruction of `instance_id`.
    ///
    /// Idempotent: once a destroy succeeded, later calls return `Ok(())` without touching the
    /// marketplace. "Not found" counts as destroyed; every other error is retried.
    pub async fn ensure_destroyed(&self, instance_id: &str) -> Result<(), LaunchError> {
        // Held across the call so concurrent requests for the same id do not both destroy.
        let mut destroyed = self.destroyed.lock().await;
        if destroyed.contains(instance_id) {
            tracing::debug!("[guard] instance {} already destroyed", instance_id);
            return Ok(());
        }

        tracing::info!("🔵 [guard] destroying instance {}", instance_id);
        let market = self.market.as_ref();
        let res = retry_with_backoff(
            &self.retry,
            "destroy instance",
            None,
            |_: &MarketplaceError| true,
            move |_| async move {
                match market.destroy_instance(instance_id).await {
                    Err(e) if e.is_not_found() => {
                        tracing::info!(
                            "[guard] instance {} not found on {}, treating as destroyed",
                            instance_id,
                            market.name()
                        );
                        Ok(())
                    }
                    other => other,
                }
            },
        )
        .await;

        match res {
            Ok(()) => {
                destroyed.insert(instance_id.to_string());
                tracing::info!("✅ [guard] instance {} destroyed", instance_id);
                Ok(())
            }
            Err(e) => {
                let attempts = e.attempts();
                let last_error = e
                    .into_inner()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "cancelled".to_string());
                tracing::error!(
                    instance_id = %instance_id,
                    "❌ [guard] FAILED to destroy instance {} after {} attempt(s): {}. It may still be billing.",
                    instance_id,
                    attempts,
                    last_error
                );
                Err(LaunchError::TerminationFailed {
                    instance_id: instance_id.to_string(),
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// Takes ownership of a freshly created instance. From here on it is destroyed on every
    /// exit path.
    pub fn lease(self: &Arc<Self>, instance: Instance) -> InstanceLease {
        InstanceLease {
            guard: Arc::clone(self),
            instance,
            released: false,
        }
    }
}

/// Result of a guarded scope: the body's result and the destroy that followed it.
#[derive(Debug)]
pub struct ScopeResult<T> {
    pub result: T,
    pub termination: Result<(), LaunchError>,
}

/// Exclusive handle on a live instance.
pub struct InstanceLease {
    guard: Arc<TerminationGuard>,
    instance: Instance,
    released: bool,
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance", &self.instance)
            .field("released", &self.released)
            .finish()
    }
}

impl InstanceLease {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut Instance {
        &mut self.instance
    }

    pub fn id(&self) -> &str {
        &self.instance.id
    }

    /// Destroys the instance now.
    pub async fn release(mut self) -> Result<(), LaunchError> {
        self.released = true;
        self.guard.ensure_destroyed(&self.instance.id).await
    }

    /// Runs `body`, then destroys the instance whatever happened: `Ok`, `Err`, or a panic.
    /// A panic is resumed after the destroy.
    pub async fn scope<T, F, Fut>(self, body: F) -> ScopeResult<T>
    where
        F: FnOnce(Instance) -> Fut,
        Fut: Future<Output = T>,
    {
        let instance = self.instance.clone();
        let outcome = AssertUnwindSafe(body(instance)).catch_unwind().await;
        let termination = self.release().await;
        match outcome {
            Ok(result) => ScopeResult {
                result,
                termination,
            },
            Err(panic) => {
                if let Err(e) = &termination {
                    tracing::error!("❌ [guard] destroy after panic failed: {}", e);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::error!(
            "❌ [guard] lease on instance {} dropped without release, destroying in background",
            self.instance.id
        );
        let guard = Arc::clone(&self.guard);
        let id = self.instance.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = guard.ensure_destroyed(&id).await;
                });
            }
            Err(_) => tracing::error!(
                "❌ [guard] no runtime to destroy instance {}; destroy it manually",
                id
            ),
        }
    }
}

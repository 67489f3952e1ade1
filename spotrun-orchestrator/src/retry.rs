use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff: `base_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// The error was not retryable.
    Permanent { attempts: u32, error: E },
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
            RetryError::Cancelled => 0,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently or the attempts run out.
///
/// Cancellation is only observed between attempts; an in-flight call is never dropped.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    cancel: Option<&CancellationToken>,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !is_transient(&e) => {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error: e,
                })
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!("[retry] {} failed after {} attempt(s): {}", what, attempt, e);
                return Err(RetryError::Exhausted { attempts: attempt, last: e });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "[retry] {} attempt {}/{} failed: {} (retrying in {:?})",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(RetryError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }
}

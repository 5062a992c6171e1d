// src/exec/retry.rs

//! Bounded retries with exponential backoff and cooperative cancellation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::config::model::RetrySection;
use crate::errors::{GenerationError, NodeError};

/// Retry budget for a single collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included. Never below 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// No retries and no waiting; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max_backoff`, scaled by a 0.8x to 1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let cap = self.max_backoff.as_millis() as u64;
        let ms = initial
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(cap);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySection::default().into()
    }
}

impl From<RetrySection> for RetryPolicy {
    fn from(cfg: RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

/// Shared cancellation flag for one running node.
///
/// Checked between retry attempts and refinement iterations, never in the
/// middle of a store commit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), NodeError> {
        if self.is_cancelled() {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// the node is cancelled. `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    label: &str,
    mut op: F,
) -> Result<T, NodeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        cancel.check()?;

        match op(attempt + 1).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let backoff = policy.backoff(attempt);
                warn!(
                    call = %label,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retrying collaborator call"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(NodeError::Generation(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_doubles_and_caps_within_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        for _ in 0..50 {
            let first = policy.backoff(0).as_millis();
            let second = policy.backoff(1).as_millis();
            let capped = policy.backoff(6).as_millis();
            assert!((79..=120).contains(&first), "{first}");
            assert!((159..=240).contains(&second), "{second}");
            assert!((239..=360).contains(&capped), "{capped}");
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_budget_is_spent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(&RetryPolicy::immediate(3), &CancelFlag::new(), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GenerationError::retryable("busy")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(NodeError::Generation(e)) if e.is_retryable()));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(&RetryPolicy::immediate(3), &CancelFlag::new(), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GenerationError::permanent("bad request")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_attempts() {
        let cancel = CancelFlag::new();
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(5), &cancel, "test", |n| {
            if n == 2 {
                cancel.cancel();
            }
            async { Err(GenerationError::retryable("busy")) }
        })
        .await;

        assert_eq!(result, Err(NodeError::Cancelled));
    }
}

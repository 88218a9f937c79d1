//! Retry-on-conflict helper
//!
//! Contains `RetryConfig` and `run_with_retry`, which reruns a transaction
//! body from a fresh snapshot whenever its commit conflicts.

use crate::branch::Branch;
use crate::manager::CommitCoordinator;
use crate::transaction::Transaction;
use std::thread;
use std::time::Duration;
use tessel_core::{CommitResult, TesselError, TesselResult, TransactionFlags};
use tracing::{debug, warn};

/// Configuration for transaction retry behavior
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new().with_max_retries(5).with_max_delay_ms(200);
/// let total = run_with_retry(&branch, &manager, &config, TransactionFlags::NONE, |txn| {
///     let n = txn.field(counter, "n")?.and_then(|v| v.as_int()).unwrap_or(0);
///     txn.set(counter, "n", n + 1)?;
///     Ok(n + 1)
/// })?;
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        // 1 << 63 is the largest shift that fits in u64
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Run `body` in a private transaction of `branch` and commit it, retrying
/// from a fresh snapshot on conflict
///
/// A conflict reported by the commit, or a retryable error returned by the
/// body, restarts the body after the backoff delay. `Abort` is never
/// retried.
///
/// # Errors
///
/// - `Conflict` after `max_retries` retries
/// - `Aborted` if the coordinator aborted the commit
/// - any non-retryable error from `body` or the commit
pub fn run_with_retry<T, F>(
    branch: &Branch,
    coordinator: &dyn CommitCoordinator,
    config: &RetryConfig,
    flags: TransactionFlags,
    mut body: F,
) -> TesselResult<T>
where
    F: FnMut(&mut Transaction) -> TesselResult<T>,
{
    let mut attempt = 0;
    loop {
        let mut txn = branch.start(flags);
        let outcome = match body(&mut txn) {
            Ok(value) => match txn.commit(coordinator)? {
                CommitResult::Success => return Ok(value),
                CommitResult::Abort => {
                    return Err(TesselError::aborted(format!(
                        "commit of {} aborted by coordinator",
                        txn.id()
                    )))
                }
                CommitResult::Conflict => TesselError::conflict(format!(
                    "commit of {} conflicted",
                    txn.id()
                )),
            },
            Err(e) if e.is_retryable() => {
                txn.abort();
                e
            }
            Err(e) => return Err(e),
        };

        if attempt >= config.max_retries {
            warn!(
                target: "tessel::txn",
                branch = %branch.id(),
                attempts = attempt + 1,
                "giving up after repeated conflicts"
            );
            return Err(outcome);
        }
        let delay = config.calculate_delay(attempt);
        debug!(
            target: "tessel::txn",
            branch = %branch.id(),
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying after conflict"
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        attempt += 1;
    }
}

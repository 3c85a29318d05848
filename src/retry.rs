//! Bounded retry with exponential backoff
//!
//! Only [`RagError::Transient`] failures are retried. Each attempt is also
//! bounded by a per-call timeout; an attempt that runs past it counts as a
//! transient failure.

use std::future::Future;
use std::time::Duration;

use crate::config::JobConfig;
use crate::error::{RagError, RagResult};
use crate::jobs::JobContext;

/// Retry policy for dependency calls made by background jobs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubled afterwards
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff
    pub max_backoff: Duration,
    /// Per-attempt timeout
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out
    ///
    /// A cancelled `ctx` ends the loop before the next attempt and interrupts
    /// an in-flight attempt or backoff.
    pub async fn run<T, F, Fut>(&self, op_name: &str, ctx: &JobContext, mut op: F) -> RagResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RagResult<T>>,
    {
        let mut attempt = 0;
        loop {
            ctx.check_cancelled()?;

            let result = tokio::select! {
                result = tokio::time::timeout(self.call_timeout, op()) => match result {
                    Ok(result) => result,
                    Err(_) => Err(RagError::transient(
                        "dependency",
                        format!("{} timed out after {:?}", op_name, self.call_timeout),
                    )),
                },
                _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        op_name,
                        err,
                        backoff,
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Longest a single `run` can take when nothing cancels it
    pub fn worst_case(&self) -> Duration {
        let backoffs: Duration = (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.backoff(attempt))
            .sum();
        self.call_timeout.saturating_mul(self.max_attempts) + backoffs
    }
}

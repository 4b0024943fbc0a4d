//! Deadline-bounded retry.
//!
//! This module provides the [`Deadline`] type and the [`retry_until`] helper
//! the notifier uses for both the discovery handshake and the data send.
//!
//! # Retry Strategy
//!
//! - Every attempt gets its own sub-deadline, clipped to what is left of the
//!   overall deadline
//! - [`PipeError::Timeout`] (the attempt ran out of time) is retried at once
//! - [`PipeError::Transport`] is retried after a fixed backoff
//! - Any other error fails immediately
//! - Cancellation aborts immediately, including during the backoff
//! - Once the overall deadline is exhausted the result is
//!   [`PipeError::TimedOut`] carrying the configured overall timeout

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::{log_debug, log_warn, PipeError, Result};

/// Overall deadline of an operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    overall: Duration,
}

impl Deadline {
    /// A deadline `overall` from now.
    pub fn after(overall: Duration) -> Self {
        // ---
        Self {
            at: Instant::now() + overall,
            overall,
        }
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The configured overall timeout.
    pub fn overall(&self) -> Duration {
        self.overall
    }

    /// The error reported once the deadline is exhausted.
    pub fn timed_out(&self) -> PipeError {
        PipeError::TimedOut(self.overall)
    }
}

/// Retry an async operation until it succeeds, fails fatally, the deadline
/// expires or `cancel` fires.
///
/// The operation receives the sub-deadline it must honour. A zero `backoff`
/// retries transport errors immediately, yielding to the scheduler between
/// attempts.
///
/// # Example
///
/// ```ignore
/// let reply = retry_until(&deadline, policy.attempt_timeout, policy.backoff, &cancel, |d| {
///     bus.request(subject.clone(), payload.clone(), d)
/// })
/// .await?;
/// ```
pub(crate) async fn retry_until<F, Fut, T>(
    deadline: &Deadline,
    attempt_timeout: Duration,
    backoff: Duration,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            log_debug!("deadline exhausted after {attempt} attempts");
            return Err(deadline.timed_out());
        }

        attempt += 1;
        let attempt_deadline = attempt_timeout.min(remaining);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipeError::Cancelled),
            outcome = operation(attempt_deadline) => outcome,
        };

        match outcome {
            Ok(value) => {
                log_debug!("attempt {attempt} succeeded");
                return Ok(value);
            }
            Err(PipeError::Timeout) => {
                log_debug!("attempt {attempt} timed out after {attempt_deadline:?}");
                if deadline.expired() {
                    return Err(deadline.timed_out());
                }
                tokio::task::yield_now().await;
            }
            Err(PipeError::Transport(details)) => {
                let pause = backoff.min(deadline.remaining());
                if backoff.is_zero() {
                    log_debug!("attempt {attempt} failed, retrying: {details}");
                    tokio::task::yield_now().await;
                    continue;
                }

                log_warn!("attempt {attempt} failed, will retry in {pause:?}: {details}");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PipeError::Cancelled),
                    _ = sleep(pause) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

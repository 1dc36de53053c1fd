//! Timeout and capped exponential backoff for side-effecting calls.
//!
//! Each attempt runs on its own thread so a hung call can be abandoned once
//! its timeout passes. The caller never blocks longer than
//! `max_attempts * timeout` plus the backoff sleeps.

use std::cmp;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_interval
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_interval);
        cmp::min(delay, self.max_interval)
    }
}

/// Runs `op` until it succeeds or the policy is exhausted. Returns the last
/// error message on failure.
///
/// Delivery is at-least-once. A timed-out attempt is abandoned, not killed:
/// its thread may still finish the side effect while the next attempt runs.
/// Callers whose effect must not repeat hand the host a stable key to dedupe
/// on (dispatches carry `ActivityRequest::idempotency_key`).
pub fn call_with_policy<T, F>(
    name: &str,
    policy: &RetryPolicy,
    timeout: Duration,
    op: F,
) -> Result<T, String>
where
    T: Send + 'static,
    F: Fn() -> Result<T, String> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts.max(1) {
        match run_attempt(Arc::clone(&op), timeout) {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!(call = name, attempt, error = %err, "Side effect attempt failed");
                last_error = err;
            }
        }
        if attempt < policy.max_attempts {
            thread::sleep(policy.backoff(attempt));
        }
    }

    Err(format!(
        "{} failed after {} attempt(s): {}",
        name,
        policy.max_attempts.max(1),
        last_error
    ))
}

fn run_attempt<T, F>(op: Arc<F>, timeout: Duration) -> Result<T, String>
where
    T: Send + 'static,
    F: Fn() -> Result<T, String> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(op());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(format!("timed out after {}ms", timeout.as_millis()))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err("call panicked".to_string()),
    }
}

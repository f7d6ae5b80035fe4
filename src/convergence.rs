//! Repeated-success convergence polling.
//!
//! A policy change reaches every proxy eventually, not atomically. A single
//! successful (or failed) probe therefore proves nothing; what we want is a
//! streak of `required_successes` consecutive successes before a deadline.
//! Any failed attempt resets the streak to zero.
//!
//! # Example
//!
//! ```ignore
//! use meshprobe::clock::TokioClock;
//! use meshprobe::convergence::{wait_for_repeated_success, ConvergencePolicy};
//!
//! let policy = ConvergencePolicy::new(5, Duration::from_secs(90))?;
//! let outcome = wait_for_repeated_success(&TokioClock, &policy, "grant", || async {
//!     probe_once().await
//! })
//! .await;
//! assert!(outcome.converged);
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::{Error, Result};

/// Fixed delay between two probe attempts
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters of one convergence window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvergencePolicy {
    /// Consecutive successes needed to declare convergence (N >= 1)
    pub required_successes: u32,
    /// Wall-clock budget for the whole window (T > 0)
    pub timeout: Duration,
    /// Constant delay between attempts
    pub interval: Duration,
}

impl ConvergencePolicy {
    /// Create a policy with the default one-second interval
    pub fn new(required_successes: u32, timeout: Duration) -> Result<Self> {
        Self::with_interval(required_successes, timeout, DEFAULT_PROBE_INTERVAL)
    }

    /// Create a policy with an explicit interval
    pub fn with_interval(
        required_successes: u32,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Self> {
        if required_successes == 0 {
            return Err(Error::validation(
                "required consecutive successes must be at least 1",
            ));
        }
        if timeout.is_zero() {
            return Err(Error::validation("convergence timeout must be positive"));
        }
        Ok(Self {
            required_successes,
            timeout,
            interval,
        })
    }
}

/// One boolean-producing attempt.
///
/// Implemented for any `FnMut() -> impl Future<Output = bool>`, so plain
/// closures work; stateful probes (ones that record a trail) implement it
/// directly.
#[async_trait]
pub trait ConvergenceProbe: Send {
    /// Make one attempt. `true` counts towards the streak.
    async fn attempt(&mut self) -> bool;
}

#[async_trait]
impl<F, Fut> ConvergenceProbe for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    async fn attempt(&mut self) -> bool {
        (self)().await
    }
}

/// What happened during a convergence window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvergenceOutcome {
    /// Whether the required streak was reached before the deadline
    pub converged: bool,
    /// Probe invocations made
    pub attempts: u32,
    /// Length of the success streak when the window ended
    pub streak: u32,
    /// Time spent in the window, measured on the injected clock
    pub elapsed: Duration,
}

/// Poll `probe` until it returns `true` `policy.required_successes` times in a
/// row, or until `policy.timeout` has elapsed.
///
/// The deadline is checked before every attempt, so a timed-out window never
/// ends before `timeout`. A timeout is an ordinary non-converged outcome.
pub async fn wait_for_repeated_success<C, P>(
    clock: &C,
    policy: &ConvergencePolicy,
    label: &str,
    mut probe: P,
) -> ConvergenceOutcome
where
    C: Clock + ?Sized,
    P: ConvergenceProbe,
{
    let start = clock.now();
    let mut attempts = 0u32;
    let mut streak = 0u32;

    info!(
        window = %label,
        required = policy.required_successes,
        timeout_secs = policy.timeout.as_secs(),
        "Waiting for repeated success"
    );

    while clock.now().duration_since(start) < policy.timeout {
        attempts += 1;

        if probe.attempt().await {
            streak += 1;
            debug!(window = %label, attempt = attempts, streak, "Attempt succeeded");
            if streak >= policy.required_successes {
                let elapsed = clock.now().duration_since(start);
                info!(
                    window = %label,
                    attempts,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Converged"
                );
                return ConvergenceOutcome {
                    converged: true,
                    attempts,
                    streak,
                    elapsed,
                };
            }
        } else {
            if streak > 0 {
                debug!(window = %label, attempt = attempts, lost = streak, "Streak reset");
            }
            streak = 0;
        }

        clock.sleep(policy.interval).await;
    }

    let elapsed = clock.now().duration_since(start);
    warn!(
        window = %label,
        attempts,
        streak,
        elapsed_secs = elapsed.as_secs_f64(),
        "Did not converge before timeout"
    );
    ConvergenceOutcome {
        converged: false,
        attempts,
        streak,
        elapsed,
    }
}

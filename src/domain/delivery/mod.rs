//! Retry and dead-letter decisions.
//!
//! Every component that retries (direct publishes, consumer handlers, the
//! outbox dispatcher) asks the same question after each attempt: try again,
//! give up, or move on. [`decide`] answers it as a pure function of an
//! explicit [`RetryState`], so the policy can be tested without timers.
//!
//! ```text
//! Succeeded                      -> Commit
//! Failed, attempts < max         -> Retry { delay = next_backoff }
//! Failed, attempts >= max        -> DeadLetter
//! ```
//!
//! Randomized jitter is applied separately by callers via [`apply_jitter`].

use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Backoff before the attempt following `failures` failures.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Per-message retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far.
    pub attempts: u32,
    /// Delay to wait before the next attempt.
    pub next_backoff: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempts: 0,
            next_backoff: policy.initial_delay,
        }
    }

    /// Resume from a persisted failure count (e.g., an outbox row's retry_count).
    pub fn resume(policy: &RetryPolicy, attempts: u32) -> Self {
        Self {
            attempts,
            next_backoff: policy.backoff_for(attempts + 1),
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

/// What to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
    Commit,
}

/// Decide the next step after an attempt and return the updated state.
pub fn decide(
    policy: &RetryPolicy,
    state: RetryState,
    outcome: AttemptOutcome,
) -> (RetryDecision, RetryState) {
    match outcome {
        AttemptOutcome::Succeeded => (RetryDecision::Commit, state),
        AttemptOutcome::Failed => {
            let attempts = state.attempts.saturating_add(1);
            if attempts >= policy.max_attempts {
                let state = RetryState { attempts, ..state };
                return (RetryDecision::DeadLetter, state);
            }
            let delay = state.next_backoff.min(policy.max_delay);
            let next = RetryState {
                attempts,
                next_backoff: policy.backoff_for(attempts + 1),
            };
            (RetryDecision::Retry { delay }, next)
        }
    }
}

/// Spread a delay by up to `ratio` in either direction.
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    delay.mul_f64(factor)
}

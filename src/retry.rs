//! Retry policy for item attempts
//!
//! All retry semantics live in [`RetryPolicy::decide`], a pure function of the
//! attempt number and the classified failure. The scheduler owns the loop and
//! the sleeping; jitter is applied by the caller through [`add_jitter`] so the
//! decision itself stays deterministic.
//!
//! # Example
//!
//! ```
//! use harvest_dl::config::RetryConfig;
//! use harvest_dl::error::FetchError;
//! use harvest_dl::retry::{Decision, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(RetryConfig {
//!     max_attempts: 3,
//!     initial_delay: Duration::from_secs(5),
//!     ..Default::default()
//! });
//!
//! let timeout = FetchError::TransientNetwork("timed out".into());
//! assert_eq!(
//!     policy.decide(1, &timeout),
//!     Decision::Retry { after: Duration::from_secs(5) }
//! );
//! assert!(matches!(policy.decide(3, &timeout), Decision::Abort(_)));
//! ```

use crate::config::RetryConfig;
use crate::error::{FetchError, ValidationFailure};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, server errors, connection resets) return `true`.
/// Permanent failures (missing resource, invalid content) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            // Network hiccups and local write failures may clear up
            FetchError::TransientNetwork(_) | FetchError::LocalIo(_) => true,
            // A different session or identity may succeed
            FetchError::Authentication { .. } | FetchError::QuotaExhausted { .. } => true,
            // The artifact was wrong; fetching it again yields the same bytes
            FetchError::ContentValidation(_) => false,
            // 404-class and missing locators never change within a run
            FetchError::PermanentRemote(_) => false,
            FetchError::Cancelled => false,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Try again after the given delay
    Retry {
        /// Delay before the next attempt
        after: Duration,
    },
    /// Stop attempting this item
    Abort(AbortReason),
}

/// Why an item was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Artifact failed validation and was discarded
    ContentInvalid(ValidationFailure),
    /// Resource is gone or was never reachable
    Permanent(String),
    /// Transient failures used up the attempt budget
    GaveUp {
        /// Attempts made
        attempts: u32,
        /// Last failure
        last_error: FetchError,
    },
    /// Run was cancelled
    Cancelled,
}

impl AbortReason {
    /// Reason text as stored in the ledger
    pub fn describe(&self) -> String {
        match self {
            AbortReason::ContentInvalid(failure) => {
                FetchError::ContentValidation(failure.clone()).reason()
            }
            AbortReason::Permanent(detail) => FetchError::PermanentRemote(detail.clone()).reason(),
            AbortReason::GaveUp {
                attempts,
                last_error,
            } => format!("{} (gave up after {} attempts)", last_error.reason(), attempts),
            AbortReason::Cancelled => FetchError::Cancelled.reason(),
        }
    }
}

/// Retry decisions with a capped, growing delay
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from its configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Maximum attempts per item
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether the caller should add jitter to retry delays
    pub fn jitter(&self) -> bool {
        self.config.jitter
    }

    /// Decide what happens after attempt number `attempt` (1-based) failed
    ///
    /// Quota exhaustion is an identity problem, so it retries immediately and
    /// does not consume the item's attempt budget; the identity pool running
    /// dry is what eventually ends such a loop.
    pub fn decide(&self, attempt: u32, outcome: &FetchError) -> Decision {
        match outcome {
            FetchError::ContentValidation(failure) => {
                Decision::Abort(AbortReason::ContentInvalid(failure.clone()))
            }
            FetchError::PermanentRemote(detail) => {
                Decision::Abort(AbortReason::Permanent(detail.clone()))
            }
            FetchError::Cancelled => Decision::Abort(AbortReason::Cancelled),
            FetchError::QuotaExhausted { .. } => Decision::Retry {
                after: Duration::ZERO,
            },
            err if err.is_retryable() => {
                if attempt >= self.config.max_attempts {
                    Decision::Abort(AbortReason::GaveUp {
                        attempts: attempt,
                        last_error: err.clone(),
                    })
                } else {
                    Decision::Retry {
                        after: self.delay_for(attempt),
                    }
                }
            }
            err => Decision::Abort(AbortReason::Permanent(err.to_string())),
        }
    }

    /// Delay before the retry that follows attempt `attempt`
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let max_delay = self.config.max_delay;
        let secs = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        // Clamp in f64: the unclamped product can overflow Duration
        let secs = secs.min(max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(max_delay)
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
pub fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::try_from_secs_f64(jittered_secs).unwrap_or(delay)
}

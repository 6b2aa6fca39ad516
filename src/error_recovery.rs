//! Bounded retry support for unreliable instrument links.
//!
//! Every supported power supply occasionally drops a reply under load, so each
//! query runs inside a [`Retry`] loop driven by a [`RetryPolicy`]. The loop owns
//! the attempt counter and the pause between attempts. The caller owns the
//! recovery step (typically draining the input buffer) and turns exhaustion into
//! a typed [`CurveTraceError::CommunicationTimeout`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut retry = Retry::new(&policy);
//! while retry.next_attempt().await {
//!     match channel.try_query("VOUT?").await {
//!         Ok(reply) => return Ok(reply),
//!         Err(e) => channel.drain().await,
//!     }
//! }
//! Err(retry.exhausted("KORAD", "VOUT?"))
//! ```

use crate::error::CurveTraceError;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times an operation is attempted in total and how long to
/// wait between attempts.
///
/// # Example
///
/// ```rust
/// use psu_curvetrace::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 10,
///     backoff_delay: Duration::from_millis(200),
/// };
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, 100 ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt ceiling and backoff.
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
        }
    }

    /// A single attempt without any pause, used while probing baud rates.
    pub fn single_shot() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn ceiling(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Attempt counter for one retried operation.
#[derive(Debug)]
pub struct Retry {
    policy: RetryPolicy,
    attempts: u32,
}

impl Retry {
    /// Start a new retry sequence.
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            attempts: 0,
        }
    }

    /// Claim the next attempt.
    ///
    /// Returns `false` once the attempt ceiling is reached. Every attempt after
    /// the first one is preceded by the policy's backoff delay.
    pub async fn next_attempt(&mut self) -> bool {
        if self.attempts >= self.policy.ceiling() {
            return false;
        }
        if self.attempts > 0 && !self.policy.backoff_delay.is_zero() {
            sleep(self.policy.backoff_delay).await;
        }
        self.attempts += 1;
        true
    }

    /// Number of attempts claimed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The error to surface once every attempt failed.
    pub fn exhausted(&self, device: &str, command: &str) -> CurveTraceError {
        CurveTraceError::CommunicationTimeout {
            device: device.to_string(),
            command: command.to_string(),
            attempts: self.attempts,
        }
    }
}

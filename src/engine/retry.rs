//! Retry policy for offer issuance.
//!
//! Failures are classified by the text the platform returned, most specific
//! match first. Retries are bounded and back off exponentially from the
//! class's base delay.

use std::time::Duration;

use crate::config::RetryConfig;

/// What kind of failure an issuance error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Web session expired ("401"): refresh it, then retry.
    SessionExpired,
    /// Transient platform error (codes containing "20").
    Transient,
    /// Platform unavailable ("503").
    Unavailable,
    /// Anything else. Not retried.
    Permanent,
}

impl FailureClass {
    pub fn classify(message: &str) -> Self {
        if message.contains("401") {
            FailureClass::SessionExpired
        } else if message.contains("20") {
            FailureClass::Transient
        } else if message.contains("503") {
            FailureClass::Unavailable
        } else {
            FailureClass::Permanent
        }
    }
}

/// Next step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        refresh_session: bool,
    },
    /// Permanent failure: flag the participant, stop.
    GiveUp,
    /// Retryable but out of attempts.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn base_delay(&self, class: FailureClass) -> Duration {
        let secs = match class {
            FailureClass::SessionExpired => self.config.session_delay_secs,
            FailureClass::Transient => self.config.transient_delay_secs,
            FailureClass::Unavailable => self.config.unavailable_delay_secs,
            FailureClass::Permanent => 0,
        };
        Duration::from_secs(secs)
    }

    /// Decide what to do after `attempt` (1-based) failed with `message`.
    pub fn decide(&self, message: &str, attempt: u32) -> RetryDecision {
        let class = FailureClass::classify(message);
        if class == FailureClass::Permanent {
            return RetryDecision::GiveUp;
        }
        if attempt >= self.config.max_attempts {
            return RetryDecision::Exhausted;
        }

        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .base_delay(class)
            .saturating_mul(factor)
            .min(Duration::from_secs(self.config.max_delay_secs));

        RetryDecision::Retry {
            delay,
            refresh_session: class == FailureClass::SessionExpired,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

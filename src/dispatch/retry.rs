//! Retry policy for failed handler invocations

use std::time::Duration;

/// What to do with a delivery whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Nack with requeue; the broker redelivers
    Requeue,
    /// Republish with the next attempt number after `delay`, then ack
    Retry { next_attempt: u32, delay: Duration },
    /// Publish to the dead-letter queue, then ack
    DeadLetter,
    /// Nack without requeue
    Discard,
}

/// Bounded retry with exponential backoff.
///
/// `max_attempts == 0` disables the bound: every failure is requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub dead_letter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            dead_letter: true,
        }
    }
}

impl RetryPolicy {
    /// Requeue every failure, forever
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Decide the action after delivery `attempt` (1-based) failed
    pub fn on_failure(&self, attempt: u32) -> FailureAction {
        if self.max_attempts == 0 {
            return FailureAction::Requeue;
        }

        let attempt = attempt.max(1);
        if attempt < self.max_attempts {
            FailureAction::Retry {
                next_attempt: attempt + 1,
                delay: self.delay_for(attempt),
            }
        } else if self.dead_letter {
            FailureAction::DeadLetter
        } else {
            FailureAction::Discard
        }
    }

    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

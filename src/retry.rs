// What a session does when the peer goes quiet.
//
// The baseline is a single wait per expected response: when it expires the transfer fails with a
// timeout. A policy with `max_retransmits > 0` instead resends the last packet the client sent
// (request, DATA, or ACK) up to that many times in a row before giving up. Any accepted packet
// counts as progress and refills the budget.

use std::time::Duration;

/// Receive timeout used when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for each expected response.
    pub timeout: Duration,

    /// Retransmissions of the last packet allowed before declaring a timeout.
    pub max_retransmits: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { timeout: DEFAULT_TIMEOUT, max_retransmits: 0 }
    }
}

impl RetryPolicy {
    pub fn with_retransmits(timeout: Duration, max_retransmits: u32) -> RetryPolicy {
        RetryPolicy { timeout, max_retransmits }
    }
}

/// What to do about an expired wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the last packet again and wait another full timeout.
    Retransmit { attempt: u32 },
    GiveUp,
}

/// Tracks the retransmission budget for the packet currently awaiting a response.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    used: u32,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Retrier {
        Retrier { policy, used: 0 }
    }

    pub fn on_timeout(&mut self) -> RetryDecision {
        if self.used >= self.policy.max_retransmits {
            return RetryDecision::GiveUp;
        }
        self.used += 1;
        RetryDecision::Retransmit { attempt: self.used }
    }

    /// Whether the policy allows any retransmission at all.
    pub fn retransmits(&self) -> bool {
        self.policy.max_retransmits > 0
    }

    /// The peer answered; the next wait starts with a full budget.
    pub fn on_progress(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_gives_up_immediately() {
        let mut retrier = Retrier::new(RetryPolicy::default());
        assert_eq!(retrier.policy.timeout, Duration::from_secs(5));
        assert_eq!(retrier.on_timeout(), RetryDecision::GiveUp);
        assert_eq!(retrier.on_timeout(), RetryDecision::GiveUp);
        assert!(!retrier.retransmits());
        assert!(Retrier::new(RetryPolicy::with_retransmits(DEFAULT_TIMEOUT, 1)).retransmits());
    }

    #[test]
    fn test_retransmits_are_bounded() {
        let mut retrier = Retrier::new(RetryPolicy::with_retransmits(Duration::from_secs(1), 2));
        assert_eq!(retrier.on_timeout(), RetryDecision::Retransmit { attempt: 1 });
        assert_eq!(retrier.on_timeout(), RetryDecision::Retransmit { attempt: 2 });
        assert_eq!(retrier.on_timeout(), RetryDecision::GiveUp);
    }

    #[test]
    fn test_progress_refills_budget() {
        let mut retrier = Retrier::new(RetryPolicy::with_retransmits(Duration::from_secs(1), 1));
        assert_eq!(retrier.on_timeout(), RetryDecision::Retransmit { attempt: 1 });
        retrier.on_progress();
        assert_eq!(retrier.on_timeout(), RetryDecision::Retransmit { attempt: 1 });
        assert_eq!(retrier.on_timeout(), RetryDecision::GiveUp);
    }
}

//! Reconnect bookkeeping and backoff policy.

use std::time::{Duration, Instant};

/// Capped linear backoff with a terminal attempt limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Added to the delay for every further failure.
    pub step: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            step: Duration::ZERO,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let extra = self.step.saturating_mul(attempt.saturating_sub(1));
        self.base_delay.saturating_add(extra).min(self.max_delay)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the delay.
    RetryAfter(Duration),
    /// The attempt limit is reached.
    GiveUp {
        /// Number of consecutive failures.
        attempts: u32,
    },
}

/// Attempt counter and retry schedule of the bus session.
///
/// The counter only grows between successes and is reset by
/// [`ReconnectState::record_success`].
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempts: u32,
    last_failure: Option<String>,
    next_delay: Option<Duration>,
    next_retry_at: Option<Instant>,
    exhausted: bool,
}

impl ReconnectState {
    /// Create a fresh state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reason of the most recent failure.
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Delay computed after the most recent failure.
    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    /// When the next attempt is scheduled.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    /// Whether the attempt limit was reached.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether an attempt is scheduled at or before `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        !self.exhausted && self.next_retry_at.is_some_and(|at| now >= at)
    }

    /// Schedule an immediate attempt after an established session dropped.
    pub fn record_lost(&mut self, reason: impl Into<String>, now: Instant) {
        self.last_failure = Some(reason.into());
        if !self.exhausted {
            self.next_retry_at = Some(now);
        }
    }

    /// Count a failed attempt and decide whether to try again.
    pub fn record_failure(
        &mut self,
        policy: &BackoffPolicy,
        reason: impl Into<String>,
        now: Instant,
    ) -> ReconnectDecision {
        self.attempts = self.attempts.saturating_add(1);
        self.last_failure = Some(reason.into());

        if self.attempts >= policy.max_attempts {
            self.exhausted = true;
            self.next_delay = None;
            self.next_retry_at = None;
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        let delay = policy.delay_for(self.attempts);
        self.next_delay = Some(delay);
        self.next_retry_at = Some(now + delay);
        ReconnectDecision::RetryAfter(delay)
    }

    /// Reset after a successful connect.
    pub fn record_success(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy_is_fixed_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_policy_is_capped() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            step: Duration::from_secs(2),
            max_delay: Duration::from_secs(6),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(4), Duration::from_secs(6));
        assert_eq!(policy.delay_for(100), Duration::from_secs(6));
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        let policy = BackoffPolicy::default();
        let mut state = ReconnectState::new();
        let now = Instant::now();

        for attempt in 1..5 {
            assert_eq!(
                state.record_failure(&policy, "refused", now),
                ReconnectDecision::RetryAfter(Duration::from_secs(5))
            );
            assert_eq!(state.attempts(), attempt);
        }

        assert_eq!(
            state.record_failure(&policy, "refused", now),
            ReconnectDecision::GiveUp { attempts: 5 }
        );
        assert!(state.is_exhausted());
        assert!(!state.is_due(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_retry_schedule() {
        let policy = BackoffPolicy::default();
        let mut state = ReconnectState::new();
        let now = Instant::now();

        assert!(!state.is_due(now));
        state.record_failure(&policy, "timeout", now);
        assert!(!state.is_due(now + Duration::from_secs(4)));
        assert!(state.is_due(now + Duration::from_secs(5)));
        assert_eq!(state.last_failure(), Some("timeout"));
    }

    #[test]
    fn test_lost_session_retries_immediately() {
        let mut state = ReconnectState::new();
        let now = Instant::now();
        state.record_lost("eof", now);
        assert!(state.is_due(now));
        assert_eq!(state.attempts(), 0);
    }

    proptest! {
        #[test]
        fn prop_attempts_monotonic_and_reset(outcomes in prop::collection::vec(any::<bool>(), 1..50)) {
            let policy = BackoffPolicy { max_attempts: u32::MAX, ..Default::default() };
            let mut state = ReconnectState::new();
            let now = Instant::now();

            for success in outcomes {
                let before = state.attempts();
                if success {
                    state.record_success();
                    prop_assert_eq!(state.attempts(), 0);
                    prop_assert!(state.last_failure().is_none());
                } else {
                    state.record_failure(&policy, "refused", now);
                    prop_assert_eq!(state.attempts(), before + 1);
                }
            }
        }
    }
}

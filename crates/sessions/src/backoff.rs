//! Reconnect policy: exponential backoff with jitter, plus a forced cooldown
//! after a burst of failures.

use std::{collections::VecDeque, time::Duration};

use {switchboard_config::ReconnectConfig, switchboard_protocol::DisconnectReason};

/// Per-session retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Reconnect attempts since the last successful open.
    pub attempts: u32,
    /// Failure instants (ms) inside the sliding window, oldest first.
    failures: VecDeque<u64>,
    /// No retry may start before this instant (ms).
    pub cooldown_until: Option<u64>,
}

impl RetryState {
    /// Forget everything. Called when a connection opens.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }
}

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Terminal code: tear down, never reconnect.
    Destroy { wipe_credentials: bool },
    /// Retries exhausted: soft-stop, credentials stay for a manual resume.
    GiveUp,
    /// Reconnect once `delay` has elapsed.
    Retry { delay: Duration, attempt: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
    pub cooldown_trigger_count: usize,
    pub cooldown_window: Duration,
    pub cooldown: Duration,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff_base(),
            cap: config.backoff_cap(),
            cooldown_trigger_count: config.cooldown_trigger_count,
            cooldown_window: config.cooldown_window(),
            cooldown: config.cooldown(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    /// Jittered exponential delay for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        raw.mul_f64(jitter)
    }

    /// Decide how to react to a close carrying `reason`.
    ///
    /// The attempt counter is bumped before the delay is computed, so the
    /// number of scheduled retries is bounded by `max_retries` no matter how
    /// the resulting timers race.
    pub fn decide(
        &self,
        state: &mut RetryState,
        reason: DisconnectReason,
        now_ms: u64,
        jitter: f64,
    ) -> CloseDecision {
        if reason.is_terminal() {
            return CloseDecision::Destroy {
                wipe_credentials: reason.wipes_credentials(),
            };
        }
        if state.attempts >= self.max_retries {
            return CloseDecision::GiveUp;
        }
        state.attempts += 1;

        let mut delay = if reason == DisconnectReason::RestartRequired {
            Duration::ZERO
        } else {
            let delay = self.backoff(state.attempts, jitter);
            state.failures.push_back(now_ms);
            let horizon = now_ms.saturating_sub(self.cooldown_window.as_millis() as u64);
            while state.failures.front().is_some_and(|&t| t < horizon) {
                state.failures.pop_front();
            }
            if state.failures.len() >= self.cooldown_trigger_count {
                let delay = delay.max(self.cooldown);
                state.cooldown_until = Some(now_ms + delay.as_millis() as u64);
                delay
            } else {
                delay
            }
        };

        if let Some(until) = state.cooldown_until {
            delay = delay.max(Duration::from_millis(until.saturating_sub(now_ms)));
        }

        CloseDecision::Retry {
            delay,
            attempt: state.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_delay(decision: CloseDecision) -> Duration {
        match decision {
            CloseDecision::Retry { delay, .. } => delay,
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn terminal_codes_never_retry() {
        let policy = ReconnectPolicy::default();
        for reason in [
            DisconnectReason::LoggedOut,
            DisconnectReason::ConnectionReplaced,
            DisconnectReason::BadSession,
            DisconnectReason::MultideviceMismatch,
        ] {
            let mut state = RetryState::default();
            let decision = policy.decide(&mut state, reason, 0, 1.0);
            assert_eq!(decision, CloseDecision::Destroy {
                wipe_credentials: reason == DisconnectReason::LoggedOut,
            });
            assert_eq!(state.attempts, 0);
        }
    }

    #[test]
    fn first_retry_follows_backoff_formula() {
        let policy = ReconnectPolicy::default();
        let mut state = RetryState::default();
        let decision = policy.decide(&mut state, DisconnectReason::ConnectionLost, 0, 0.5);
        assert_eq!(decision, CloseDecision::Retry {
            delay: Duration::from_millis(2_500),
            attempt: 1,
        });
        assert_eq!(state.attempts, 1);
    }

    #[test]
    fn attempts_are_bounded_and_delays_in_range() {
        let policy = ReconnectPolicy::default();
        for jitter in [0.5, 0.75, 1.0, 1.25, 1.4999] {
            let mut state = RetryState::default();
            let mut now = 0u64;
            let mut retries = 0;
            loop {
                // Space failures out so the cooldown never kicks in.
                now += policy.cooldown_window.as_millis() as u64 + 1;
                match policy.decide(&mut state, DisconnectReason::ConnectionClosed, now, jitter) {
                    CloseDecision::Retry { delay, attempt } => {
                        retries += 1;
                        let raw = policy.base * 2u32.pow(attempt - 1);
                        assert!(delay >= raw.mul_f64(0.5), "attempt {attempt}: {delay:?}");
                        assert!(delay <= raw.min(policy.cap).mul_f64(1.5));
                    },
                    CloseDecision::GiveUp => break,
                    CloseDecision::Destroy { .. } => unreachable!(),
                }
            }
            assert_eq!(retries, policy.max_retries);
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(20, 1.0), policy.cap);
        assert_eq!(policy.backoff(20, 0.5), policy.cap / 2);
    }

    #[test]
    fn restart_required_is_immediate() {
        let policy = ReconnectPolicy::default();
        let mut state = RetryState::default();
        let delay = retry_delay(policy.decide(
            &mut state,
            DisconnectReason::RestartRequired,
            0,
            1.0,
        ));
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(state.attempts, 1);
        assert_eq!(state.recent_failures(), 0);
    }

    #[test]
    fn burst_of_failures_forces_cooldown() {
        let policy = ReconnectPolicy {
            max_retries: 10,
            ..Default::default()
        };
        let mut state = RetryState::default();
        let d1 = retry_delay(policy.decide(&mut state, DisconnectReason::ConnectionLost, 0, 1.0));
        let d2 = retry_delay(policy.decide(&mut state, DisconnectReason::ConnectionLost, 10_000, 1.0));
        assert!(d1 < policy.cooldown && d2 < policy.cooldown);

        let d3 = retry_delay(policy.decide(&mut state, DisconnectReason::ConnectionLost, 20_000, 1.0));
        assert!(d3 >= policy.cooldown);
        let d4 = retry_delay(policy.decide(&mut state, DisconnectReason::ConnectionLost, 30_000, 1.0));
        assert!(d4 >= policy.cooldown);
    }

    #[test]
    fn no_retry_before_cooldown_ends() {
        let policy = ReconnectPolicy {
            max_retries: 10,
            ..Default::default()
        };
        let mut state = RetryState::default();
        for t in [0, 1_000, 2_000] {
            policy.decide(&mut state, DisconnectReason::ConnectionLost, t, 1.0);
        }
        let until = state.cooldown_until.unwrap();

        // A restart-required close right after must still wait out the cooldown.
        let now = 3_000;
        let delay = retry_delay(policy.decide(&mut state, DisconnectReason::RestartRequired, now, 1.0));
        assert_eq!(now + delay.as_millis() as u64, until);
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let policy = ReconnectPolicy {
            max_retries: 10,
            ..Default::default()
        };
        let window = policy.cooldown_window.as_millis() as u64;
        let mut state = RetryState::default();
        policy.decide(&mut state, DisconnectReason::ConnectionLost, 0, 1.0);
        policy.decide(&mut state, DisconnectReason::ConnectionLost, 1, 1.0);
        let delay = retry_delay(policy.decide(
            &mut state,
            DisconnectReason::ConnectionLost,
            window + 2,
            1.0,
        ));
        assert_eq!(state.recent_failures(), 1);
        assert!(delay < policy.cooldown);
        assert!(state.cooldown_until.is_none());
    }

    #[test]
    fn reset_clears_everything() {
        let policy = ReconnectPolicy::default();
        let mut state = RetryState::default();
        for t in [0, 1, 2] {
            policy.decide(&mut state, DisconnectReason::ConnectionLost, t, 1.0);
        }
        assert!(state.cooldown_until.is_some());
        state.reset();
        assert_eq!(state, RetryState::default());
    }
}

//! Reconnection mit exponentiellem Backoff

use std::time::Duration;

/// Standard: 1s Startverzögerung, maximal 5 Versuche
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Zähler und Backoff einer Transport-Instanz
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttemptState {
    attempt_count: u32,
    current_backoff: Duration,
    policy: ReconnectPolicy,
}

impl ConnectionAttemptState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            attempt_count: 0,
            current_backoff: policy.base_delay,
            policy,
        }
    }

    /// Registriert einen Verbindungsabbruch
    ///
    /// Gibt die Verzögerung für den nächsten Versuch zurück, oder `None`
    /// wenn alle Versuche aufgebraucht sind.
    pub fn record_failure(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.current_backoff;
        self.current_backoff = delay
            .checked_mul(2)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);
        Some(delay)
    }

    /// Verbindung steht wieder: zurück auf Anfang
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.current_backoff = self.policy.base_delay;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.policy.max_attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Verzögerung, die der nächste Versuch bekommen würde
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(30),
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles_until_exhausted() {
        let mut state = ConnectionAttemptState::new(policy(1000, 5));

        let delays: Vec<Duration> = std::iter::from_fn(|| state.record_failure()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(16000),
            ]
        );
        assert!(state.is_exhausted());
        assert_eq!(state.record_failure(), None);
        assert_eq!(state.attempt_count(), 5);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let mut state = ConnectionAttemptState::new(policy(7000, 20));
        let mut previous = Duration::ZERO;
        while let Some(delay) = state.record_failure() {
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(30));
    }

    #[test]
    fn test_reset_restarts_at_base_delay() {
        let mut state = ConnectionAttemptState::new(policy(250, 5));
        state.record_failure();
        state.record_failure();
        assert_eq!(state.current_backoff(), Duration::from_millis(1000));

        state.reset();
        assert_eq!(state.attempt_count(), 0);
        assert_eq!(state.record_failure(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut state = ConnectionAttemptState::new(policy(100, 0));
        assert_eq!(state.record_failure(), None);
    }
}

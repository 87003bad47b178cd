use std::time::Duration;

use serde::Deserialize;

use crate::errors::DisconnectReason;

/// How long to wait before reconnect attempt `n`.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// No delay at all.
    None,
    Constant {
        delay_ms: u64,
    },
    Linear {
        base_ms: u64,
        increment_ms: u64,
        max_ms: u64,
    },
    Exponential {
        base_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl BackoffStrategy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Constant { delay_ms } => Duration::from_millis(delay_ms),
            BackoffStrategy::Linear {
                base_ms,
                increment_ms,
                max_ms,
            } => {
                let raw = base_ms.saturating_add(increment_ms.saturating_mul(attempt as u64));
                Duration::from_millis(raw.min(max_ms))
            }
            BackoffStrategy::Exponential {
                base_ms,
                multiplier,
                max_ms,
            } => {
                let raw = base_ms as f64 * multiplier.powi(attempt as i32);
                Duration::from_millis((raw as u64).min(max_ms))
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_ms: 500,
            multiplier: 2.0,
            max_ms: 60_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Jitter fraction in [0, 1]: each delay is scaled by a random factor in
    /// [1-j, 1+j].
    pub jitter: f64,
    /// A connection that lived at least this long resets the retry counter.
    pub reset_threshold_ms: u64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            backoff: BackoffStrategy::default(),
            jitter: 0.2,
            reset_threshold_ms: 60_000,
        }
    }
}

impl ReconnectionPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn reset_threshold(&self) -> Duration {
        Duration::from_millis(self.reset_threshold_ms)
    }

    /// Whether attempt number `attempt` (zero-based) should happen at all
    /// for a disconnect with the given reason.
    pub fn should_reconnect(&self, attempt: u32, reason: &DisconnectReason) -> bool {
        self.enabled && attempt < self.max_retries && reason.is_recoverable()
    }

    /// The backoff delay with jitter applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.delay(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (rand::random::<f64>() * 2.0 - 1.0);
        base.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    #[test]
    fn exponential_delays_cap_out() {
        let backoff = BackoffStrategy::Exponential {
            base_ms: 100,
            multiplier: 2.0,
            max_ms: 1000,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn linear_delays_cap_out() {
        let backoff = BackoffStrategy::Linear {
            base_ms: 100,
            increment_ms: 50,
            max_ms: 260,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(100), Duration::from_millis(260));
    }

    #[test]
    fn none_is_zero_even_with_jitter() {
        let policy = ReconnectionPolicy {
            backoff: BackoffStrategy::None,
            jitter: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.next_delay(3), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = ReconnectionPolicy {
            backoff: BackoffStrategy::Constant { delay_ms: 1000 },
            jitter: 0.5,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = policy.next_delay(0);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay <= Duration::from_millis(1500), "{delay:?}");
        }
    }

    #[test]
    fn should_reconnect_matrix() {
        let policy = ReconnectionPolicy {
            max_retries: 3,
            ..Default::default()
        };
        assert!(policy.should_reconnect(0, &DisconnectReason::RemoteClose));
        assert!(policy.should_reconnect(2, &DisconnectReason::HealthCheckFailed));
        assert!(!policy.should_reconnect(3, &DisconnectReason::RemoteClose));
        assert!(!policy.should_reconnect(0, &DisconnectReason::LocalClose));
        assert!(!policy.should_reconnect(
            0,
            &DisconnectReason::error(ErrorCategory::Protocol, "misbehaved")
        ));
        assert!(policy.should_reconnect(
            0,
            &DisconnectReason::error(ErrorCategory::Transport, "flaky link")
        ));
        assert!(!ReconnectionPolicy::disabled().should_reconnect(0, &DisconnectReason::Timeout));
    }
}

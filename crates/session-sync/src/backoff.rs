//! # Reconnect Backoff
//!
//! Exponential backoff with symmetric jitter for reconnection attempts.
//!
//! The pre-jitter delay for the k-th consecutive failed attempt (0-based) is
//! `min(2^k × unit, cap)`; the jittered delay is drawn uniformly from
//! `[(1 - jitter) × base, (1 + jitter) × base]`. With the defaults
//! (`unit = 1s`, `cap = 30s`, `jitter = 0.25`) that is 1s, 2s, 4s, 8s, 16s,
//! 30s, 30s, … each ±25 %.
//!
//! ```
//! use session_sync::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::default();
//! assert_eq!(policy.base_delay(3), Duration::from_secs(8));
//! assert_eq!(policy.base_delay(10), Duration::from_secs(30));
//! ```

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Policy controlling reconnect delays and the give-up point.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry, doubled on each further failure.
    pub unit: Duration,

    /// Upper bound of the pre-jitter delay.
    pub cap: Duration,

    /// Consecutive failed attempts after which automatic retry stops.
    /// 0 means unlimited.
    pub max_attempts: u32,

    /// Relative jitter, 0.25 → ±25 %.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            unit: Duration::from_secs(1),
            cap: Duration::from_secs(config.cap_secs),
            max_attempts: config.max_attempts,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Pre-jitter delay for the given 0-based attempt.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // 2^31 seconds is far beyond any sane cap; saturate instead of overflowing.
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay for the given attempt using the thread RNG.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let unit_sample: f64 = rand::thread_rng().r#gen();
        self.jittered_delay_with(attempt, unit_sample)
    }

    /// Jittered delay with an explicit sample in `[0, 1]`.
    ///
    /// 0 maps to the low end of the jitter window, 1 to the high end.
    #[must_use]
    pub fn jittered_delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * sample.clamp(0.0, 1.0);
        Duration::from_secs_f64(base * factor)
    }

    /// Whether `attempts` consecutive failures exhaust the policy.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

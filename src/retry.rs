//! Retry policy for durable procedures

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for retrying a failed task
///
/// Supports exponential backoff with optional jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use dfns::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_delay(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Cap on the backed-off delay
    #[serde(with = "option_duration_millis")]
    pub max_delay: Option<Duration>,

    /// Multiplier applied per retry (1.0 = fixed interval)
    pub backoff_factor: f64,

    /// Fraction of the delay to randomize, 0.0-1.0
    #[serde(default)]
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// A policy that never retries: one attempt only.
    ///
    /// This is the descriptor default per the registration surface.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: None,
            backoff_factor: 1.0,
            jitter_fraction: 0.0,
        }
    }

    /// Exponential backoff with sensible defaults: 5 attempts, 1s initial
    /// delay, 2x backoff, capped at 60s, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(60)),
            backoff_factor: 2.0,
            jitter_fraction: 0.1,
        }
    }

    /// A policy with a fixed delay between attempts (no backoff).
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: Some(delay),
            backoff_factor: 1.0,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    pub fn with_jitter_fraction(mut self, jitter: f64) -> Self {
        self.jitter_fraction = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `n` (1-based: the first retry after the initial
    /// attempt is `n = 1`).
    ///
    /// `delay(n) = min(max_delay, initial_delay * backoff_factor^(n-1)) * (1 ± jitter_fraction)`
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        let n = n.max(1);
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(n as i32 - 1);
        let capped = match self.max_delay {
            Some(max) => base.min(max.as_secs_f64()),
            None => base,
        };

        let jittered = if self.jitter_fraction > 0.0 {
            let mut rng = rand::thread_rng();
            let spread = capped * self.jitter_fraction;
            (capped + rng.gen_range(-spread..=spread)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether `retries` completed attempts leaves at least one more attempt.
    pub fn has_attempts_remaining(&self, retries: u32) -> bool {
        retries + 1 < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_has_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(0));
    }

    #[test]
    fn exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.backoff_factor, 2.0);
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy::exponential().with_jitter_fraction(0.0);

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(5))
            .with_jitter_fraction(0.0);

        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(5));
    }

    #[test]
    fn fixed_policy_never_backs_off() {
        let policy = RetryPolicy::fixed(Duration::from_secs(3), 4);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
    }

    #[test]
    fn has_attempts_remaining_tracks_max_attempts() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(0));
        assert!(policy.has_attempts_remaining(1));
        assert!(!policy.has_attempts_remaining(2));
    }

    #[test]
    fn serialization_round_trips() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}

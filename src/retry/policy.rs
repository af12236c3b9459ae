//! Exponential backoff with bounded jitter for channel reconnection

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::{StreamConfig, RETRY_DELAY_CEILING_MS};
use crate::error::StreamError;

/// Delay computed for one retry attempt (all values in milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryDelay {
    /// `base * 2^attempt`, saturating instead of overflowing
    pub exponential_ms: u64,
    /// `min(exponential, max)`
    pub clamped_ms: u64,
    /// Jittered wait sampled from `[base, clamped]`
    pub chosen_ms: u64,
}

impl RetryDelay {
    pub fn chosen(&self) -> Duration {
        Duration::from_millis(self.chosen_ms)
    }
}

/// Side-effect free description of the window a retry would be drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryDelayPreview {
    pub attempt: u32,
    pub exponential_ms: u64,
    pub clamped_ms: u64,
    pub min_bound_ms: u64,
    pub max_bound_ms: u64,
}

/// Unclamped and clamped exponential bounds for `attempt`
pub fn exponential_bounds(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> (u64, u64) {
    let exponential = 2u64
        .checked_pow(attempt)
        .map_or(u64::MAX, |factor| base_delay_ms.saturating_mul(factor));
    (exponential, exponential.min(max_delay_ms))
}

/// Compute the wait before retry `attempt` using the supplied random source.
///
/// The chosen delay is uniform over `[base, clamped]`: the floor never drops
/// below the base delay, so a burst of failing channels cannot retry at once,
/// while the ceiling grows exponentially up to the cap.
pub fn compute_delay<R: Rng + ?Sized>(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    rng: &mut R,
) -> RetryDelay {
    let (exponential_ms, clamped_ms) = exponential_bounds(attempt, base_delay_ms, max_delay_ms);
    let floor = base_delay_ms.min(clamped_ms);
    let chosen_ms = if clamped_ms > floor {
        rng.random_range(floor..=clamped_ms)
    } else {
        floor
    };

    RetryDelay {
        exponential_ms,
        clamped_ms,
        chosen_ms,
    }
}

/// Stateless retry policy bound to a validated base/max pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    /// Create a policy; `max_delay_ms` is clamped to the 30s system ceiling
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Result<Self, StreamError> {
        if base_delay_ms == 0 || max_delay_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "retry delays must be positive".into(),
            ));
        }
        let max_delay_ms = max_delay_ms.min(RETRY_DELAY_CEILING_MS);
        if base_delay_ms > max_delay_ms {
            return Err(StreamError::InvalidConfig(format!(
                "base retry delay {}ms exceeds max retry delay {}ms",
                base_delay_ms, max_delay_ms
            )));
        }
        Ok(Self {
            base_delay_ms,
            max_delay_ms,
        })
    }

    pub fn from_config(config: &StreamConfig) -> Result<Self, StreamError> {
        Self::new(config.base_retry_delay_ms, config.max_retry_delay_ms)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Delay for `attempt` drawn from the thread-local generator
    pub fn delay(&self, attempt: u32) -> RetryDelay {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Delay for `attempt` drawn from an explicit generator
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> RetryDelay {
        compute_delay(attempt, self.base_delay_ms, self.max_delay_ms, rng)
    }

    pub fn preview(&self, attempt: u32) -> RetryDelayPreview {
        let (exponential_ms, clamped_ms) =
            exponential_bounds(attempt, self.base_delay_ms, self.max_delay_ms);
        RetryDelayPreview {
            attempt,
            exponential_ms,
            clamped_ms,
            min_bound_ms: self.base_delay_ms,
            max_bound_ms: clamped_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: RETRY_DELAY_CEILING_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_preview_matches_documented_values() {
        let policy = RetryPolicy::new(1_000, 30_000).unwrap();

        let first = policy.preview(0);
        assert_eq!(first.exponential_ms, 1_000);
        assert_eq!(first.clamped_ms, 1_000);

        let sixth = policy.preview(5);
        assert_eq!(sixth.exponential_ms, 32_000);
        assert_eq!(sixth.clamped_ms, 30_000);
        assert_eq!(sixth.min_bound_ms, 1_000);
        assert_eq!(sixth.max_bound_ms, 30_000);
    }

    #[test]
    fn test_chosen_within_bounds() {
        let policy = RetryPolicy::new(250, 10_000).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..40 {
            let delay = policy.delay_with(attempt, &mut rng);
            assert!(delay.clamped_ms <= 10_000);
            assert!(delay.chosen_ms >= 250, "attempt {attempt}: {delay:?}");
            assert!(delay.chosen_ms <= delay.clamped_ms, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_upper_bound_non_decreasing() {
        let policy = RetryPolicy::new(100, 30_000).unwrap();
        let mut previous = 0;
        for attempt in 0..100 {
            let clamped = policy.preview(attempt).clamped_ms;
            assert!(clamped >= previous);
            previous = clamped;
        }
        assert_eq!(previous, 30_000);
    }

    #[test]
    fn test_large_attempt_saturates() {
        let (exponential, clamped) = exponential_bounds(200, 1_000, 30_000);
        assert_eq!(exponential, u64::MAX);
        assert_eq!(clamped, 30_000);
    }

    #[test]
    fn test_deterministic_with_seeded_rng() {
        let policy = RetryPolicy::default();
        let a = policy.delay_with(4, &mut StdRng::seed_from_u64(42));
        let b = policy.delay_with(4, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_first_attempt_waits_exactly_base() {
        let policy = RetryPolicy::new(1_000, 30_000).unwrap();
        let delay = policy.delay(0);
        assert_eq!(delay.chosen_ms, 1_000);
        assert_eq!(delay.chosen(), Duration::from_secs(1));
    }

    #[test]
    fn test_max_clamped_to_ceiling() {
        let policy = RetryPolicy::new(1_000, 600_000).unwrap();
        assert_eq!(policy.max_delay_ms(), 30_000);
    }

    #[test]
    fn test_rejects_invalid_bounds() {
        assert!(RetryPolicy::new(0, 1_000).is_err());
        assert!(RetryPolicy::new(1_000, 0).is_err());
        assert!(RetryPolicy::new(40_000, 50_000).is_err());
    }
}

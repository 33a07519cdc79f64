//! Backoff policy: jitter and growth of retry / wait delays.
//!
//! Pure computation. Two delays are tracked per run and grow independently:
//!
//! - the **retry backoff** (delay before resubmitting a failed action), which
//!   is multiplied by the run's `base` after every observed failure
//! - the **wait backoff** (delay between status checks of an attempt that is
//!   still running), which doubles after every "still running" observation
//!
//! Neither is capped. A `base <= 1` yields constant or shrinking retry delays
//! and is accepted as-is.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::types::RetryOptions;

/// Growth factor applied to the wait backoff after each "still running" check.
pub const WAIT_BACKOFF_GROWTH: f64 = 2.0;

/// Scale `delay_ms` by a uniform factor in `[0.5, 1.5)`.
pub fn with_jitter(delay_ms: f64) -> f64 {
    with_jitter_from(&mut rand::thread_rng(), delay_ms)
}

/// `with_jitter` drawing from the given RNG.
pub fn with_jitter_from<R: Rng + ?Sized>(rng: &mut R, delay_ms: f64) -> f64 {
    delay_ms * (0.5 + rng.r#gen::<f64>())
}

/// Convert a (possibly jittered) millisecond delay into a `Duration`.
///
/// Negative or NaN delays become zero; delays too large to represent saturate.
pub fn to_duration(delay_ms: f64) -> Duration {
    if delay_ms.is_nan() || delay_ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(delay_ms / 1000.0).unwrap_or(Duration::MAX)
}

/// The mutable part of a run's retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffState {
    /// Nominal delay before the next retry after a failure
    pub retry_backoff_ms: f64,
    /// Nominal delay before the next status check of a running attempt
    pub wait_backoff_ms: f64,
    /// Failures still tolerated before the run is finalized as failed
    pub remaining_failures: u32,
}

impl BackoffState {
    pub fn from_options(options: &RetryOptions) -> Self {
        Self {
            retry_backoff_ms: options.initial_backoff_ms,
            wait_backoff_ms: options.wait_backoff_ms,
            remaining_failures: options.max_failures,
        }
    }

    /// Whether another failure can be retried.
    pub fn has_budget(&self) -> bool {
        self.remaining_failures > 0
    }

    /// State after observing that the attempt is still pending or running.
    pub fn after_wait(self) -> Self {
        Self {
            wait_backoff_ms: self.wait_backoff_ms * WAIT_BACKOFF_GROWTH,
            ..self
        }
    }

    /// State after scheduling a retry for an observed failure.
    pub fn after_failure(self, base: f64) -> Self {
        Self {
            retry_backoff_ms: self.retry_backoff_ms * base,
            remaining_failures: self.remaining_failures.saturating_sub(1),
            ..self
        }
    }

    /// Nominal delay before the follow-up check of a freshly scheduled retry.
    pub fn retry_check_delay_ms(&self) -> f64 {
        self.retry_backoff_ms + self.wait_backoff_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state(retry: f64, wait: f64, budget: u32) -> BackoffState {
        BackoffState {
            retry_backoff_ms: retry,
            wait_backoff_ms: wait,
            remaining_failures: budget,
        }
    }

    #[test]
    fn failure_grows_retry_backoff_and_consumes_budget() {
        let s = state(1000.0, 100.0, 2).after_failure(2.0);
        assert_eq!(s.retry_backoff_ms, 2000.0);
        assert_eq!(s.wait_backoff_ms, 100.0);
        assert_eq!(s.remaining_failures, 1);

        let s = s.after_failure(2.0);
        assert_eq!(s.retry_backoff_ms, 4000.0);
        assert_eq!(s.remaining_failures, 0);
        assert!(!s.has_budget());
    }

    #[test]
    fn wait_backoff_doubles_independently() {
        let s = state(1000.0, 100.0, 2).after_wait().after_wait();
        assert_eq!(s.wait_backoff_ms, 400.0);
        assert_eq!(s.retry_backoff_ms, 1000.0);
        assert_eq!(s.remaining_failures, 2);
    }

    #[test]
    fn base_at_or_below_one_does_not_grow() {
        let s = state(500.0, 100.0, 3).after_failure(1.0);
        assert_eq!(s.retry_backoff_ms, 500.0);
        let s = s.after_failure(0.5);
        assert_eq!(s.retry_backoff_ms, 250.0);
    }

    #[test]
    fn budget_never_underflows() {
        assert_eq!(state(1.0, 1.0, 0).after_failure(2.0).remaining_failures, 0);
    }

    #[test]
    fn to_duration_handles_degenerate_values() {
        assert_eq!(to_duration(-5.0), Duration::ZERO);
        assert_eq!(to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(to_duration(1500.0), Duration::from_millis(1500));
    }

    #[test]
    fn jitter_is_not_constant() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<f64> = (0..32).map(|_| with_jitter_from(&mut rng, 1000.0)).collect();
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(max - min > 100.0, "jitter spread too small: {min}..{max}");
    }

    #[test]
    fn jitter_mean_is_close_to_nominal() {
        let n = 10_000;
        let total: f64 = (0..n).map(|_| with_jitter(1000.0)).sum();
        let mean = total / n as f64;
        assert!((mean - 1000.0).abs() < 30.0, "mean {mean} too far from nominal");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a jittered delay always lies in [0.5d, 1.5d].
        #[test]
        fn jitter_stays_within_bounds(delay in 0.0f64..1.0e9, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let jittered = with_jitter_from(&mut rng, delay);
            prop_assert!(jittered >= 0.5 * delay);
            prop_assert!(jittered <= 1.5 * delay);
        }

        /// Property: with base > 1 the nominal retry delay strictly increases
        /// across successive failures.
        #[test]
        fn retry_backoff_strictly_increases(
            initial in 1.0f64..10_000.0,
            base in 1.01f64..4.0,
            failures in 1u32..12,
        ) {
            let mut s = state(initial, 100.0, failures);
            let mut previous = s.retry_backoff_ms;
            while s.has_budget() {
                s = s.after_failure(base);
                prop_assert!(s.retry_backoff_ms > previous);
                previous = s.retry_backoff_ms;
            }
        }
    }
}

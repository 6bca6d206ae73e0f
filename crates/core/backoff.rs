//! Retry delay calculation.
//!
//! Two strategies coexist: the generic exponential calculator used by
//! [`crate::retry`], and the per-job [`Backoff`] carried in a job payload,
//! which may be a fixed delay, an explicit per-attempt sequence, or the
//! exponential calculator again.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fraction of the computed delay that jitter may add or remove.
pub const JITTER_RATIO: f64 = 0.3;

/// Compute the delay before the next retry.
///
/// `delay = initial_delay * backoff_factor ^ attempt_count`. With `jitter`
/// the result is perturbed uniformly within `±30%`. There is no upper bound;
/// callers cap the number of retries instead.
pub fn calculate_delay(
    attempt_count: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    jitter: bool,
) -> Duration {
    let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
    let mut delay = initial_delay.as_secs_f64() * backoff_factor.powi(exponent);

    if jitter {
        delay += (delay * JITTER_RATIO) * (rand::random::<f64>() - 0.5) * 2.0;
    }

    Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(Duration::MAX)
}

/// Per-job retry delay strategy.
///
/// Serialized untagged so payloads read naturally: `3`, `[60, 120, 300]` or
/// `{"initial_ms": 1000, "factor": 2.0, "jitter": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Backoff {
    /// Same delay in seconds before every retry.
    Fixed(u64),
    /// Delay in seconds per attempt; attempts past the end reuse the last entry.
    Sequence(Vec<u64>),
    /// Exponential backoff computed by [`calculate_delay`].
    Exponential {
        initial_ms: u64,
        factor: f64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(3)
    }
}

impl Backoff {
    /// Delay before the retry that follows failed attempt number `attempts`
    /// (1-based, as stored on the job after a claim).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let index = attempts.saturating_sub(1);
        match self {
            Backoff::Fixed(secs) => Duration::from_secs(*secs),
            Backoff::Sequence(steps) => {
                let step = steps
                    .get(index as usize)
                    .or_else(|| steps.last())
                    .copied()
                    .unwrap_or(0);
                Duration::from_secs(step)
            }
            Backoff::Exponential {
                initial_ms,
                factor,
                jitter,
            } => calculate_delay(index, Duration::from_millis(*initial_ms), *factor, *jitter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_delay_without_jitter() {
        let initial = Duration::from_millis(1000);
        assert_eq!(calculate_delay(0, initial, 2.0, false), Duration::from_millis(1000));
        assert_eq!(calculate_delay(1, initial, 2.0, false), Duration::from_millis(2000));
        assert_eq!(calculate_delay(2, initial, 2.0, false), Duration::from_millis(4000));
        assert_eq!(calculate_delay(5, initial, 2.0, false), Duration::from_millis(32000));
    }

    #[test]
    fn test_calculate_delay_other_factors() {
        let initial = Duration::from_millis(500);
        assert_eq!(calculate_delay(3, initial, 1.0, false), Duration::from_millis(500));
        assert_eq!(calculate_delay(2, initial, 3.0, false), Duration::from_millis(4500));
    }

    #[test]
    fn test_calculate_delay_with_jitter_stays_in_bounds() {
        let initial = Duration::from_millis(1000);
        for attempt in 0..6 {
            let base = calculate_delay(attempt, initial, 2.0, false).as_secs_f64();
            for _ in 0..200 {
                let delay = calculate_delay(attempt, initial, 2.0, true).as_secs_f64();
                assert!(delay >= base * 0.7 - 1e-9, "{delay} below {base}");
                assert!(delay <= base * 1.3 + 1e-9, "{delay} above {base}");
            }
        }
    }

    #[test]
    fn test_calculate_delay_huge_exponent_saturates() {
        let delay = calculate_delay(u32::MAX, Duration::from_secs(1), 2.0, false);
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff, Backoff::Fixed(3));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(3));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(3));
    }

    #[test]
    fn test_sequence_backoff_indexed_by_attempt() {
        let backoff = Backoff::Sequence(vec![60, 120, 300]);
        assert_eq!(backoff.delay_for(1), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(120));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(9), Duration::from_secs(300));
    }

    #[test]
    fn test_empty_sequence_means_no_delay() {
        assert_eq!(Backoff::Sequence(vec![]).delay_for(1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_uses_calculator() {
        let backoff = Backoff::Exponential {
            initial_ms: 1000,
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_json_shapes() {
        let fixed: Backoff = serde_json::from_str("10").unwrap();
        assert_eq!(fixed, Backoff::Fixed(10));

        let seq: Backoff = serde_json::from_str("[60,120,300]").unwrap();
        assert_eq!(seq, Backoff::Sequence(vec![60, 120, 300]));

        let exp: Backoff = serde_json::from_str(r#"{"initial_ms":250,"factor":1.5}"#).unwrap();
        assert_eq!(
            exp,
            Backoff::Exponential {
                initial_ms: 250,
                factor: 1.5,
                jitter: false
            }
        );
    }
}

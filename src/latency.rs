//! Latency simulation for the in-process [`crate::engine_client::SimulatedEngineClient`].
//!
//! The real engine RPCs (spec.md §6) are network calls to a heterogeneous
//! backend fleet; this profile lets tests and the demo CLI exercise the
//! dispatcher/session pipeline without one.

use rand_distr::{Distribution, Normal};
use std::time::Duration;

/// Timing profile for a simulated engine: time-to-first-token and
/// time-between-tokens, each sampled from a normal distribution.
#[derive(Debug, Clone)]
pub struct LatencyProfile {
    pub ttft_mean_ms: u64,
    pub ttft_stddev_ms: u64,
    pub tbt_mean_ms: u64,
    pub tbt_stddev_ms: u64,
}

impl LatencyProfile {
    pub fn new(ttft_mean_ms: u64, ttft_stddev_ms: u64, tbt_mean_ms: u64, tbt_stddev_ms: u64) -> Self {
        Self {
            ttft_mean_ms,
            ttft_stddev_ms,
            tbt_mean_ms,
            tbt_stddev_ms,
        }
    }

    /// A representative profile for a mid-sized model: ~400ms to first
    /// token, ~30ms between tokens.
    pub fn default_profile() -> Self {
        Self::new(400, 100, 30, 10)
    }

    /// No delay at all — for fast tests.
    pub fn instant() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Minimal delay — quick but still exercises the async sleep path.
    pub fn fast() -> Self {
        Self::new(5, 1, 1, 0)
    }

    pub fn sample_ttft(&self) -> Duration {
        Self::sample(self.ttft_mean_ms, self.ttft_stddev_ms)
    }

    pub fn sample_tbt(&self) -> Duration {
        Self::sample(self.tbt_mean_ms, self.tbt_stddev_ms)
    }

    fn sample(mean_ms: u64, stddev_ms: u64) -> Duration {
        if mean_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        let sample_ms = if stddev_ms > 0 {
            let normal = Normal::new(mean_ms as f64, stddev_ms as f64)
                .unwrap_or_else(|_| Normal::new(mean_ms as f64, 1.0).unwrap());
            normal.sample(&mut rng).max(1.0) as u64
        } else {
            mean_ms
        };
        Duration::from_millis(sample_ms)
    }
}

impl Default for LatencyProfile {
    fn default() -> Self {
        Self::default_profile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_profile_has_zero_delay() {
        let p = LatencyProfile::instant();
        assert_eq!(p.sample_ttft(), Duration::ZERO);
        assert_eq!(p.sample_tbt(), Duration::ZERO);
    }

    #[test]
    fn default_profile_samples_are_positive() {
        let p = LatencyProfile::default_profile();
        for _ in 0..20 {
            assert!(p.sample_ttft() > Duration::ZERO);
            assert!(p.sample_tbt() > Duration::ZERO);
        }
    }
}

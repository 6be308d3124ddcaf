//! TTL policy
//!
//! Computes effective TTLs with Gaussian jitter (the avalanche defence),
//! decides expiry, and decides pre-refresh eligibility. Every decision
//! routes through the injected clock.

use std::sync::Arc;

use rand::Rng;

use crate::traits::Clock;

/// TTL decisions for one engine instance
pub struct TtlPolicy {
    clock: Arc<dyn Clock>,
}

impl TtlPolicy {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Whether a TTL value calls for an expiring write.
    #[must_use]
    pub fn should_apply(ttl_seconds: Option<u64>) -> bool {
        ttl_seconds.is_some_and(|t| t > 0)
    }

    /// Effective TTL with optional Gaussian jitter.
    ///
    /// With jitter on, a standard normal draw clamped to ±3σ scales the
    /// variance fraction of the base: `offset = base · variance · g / 3`.
    /// The result stays within `[1, 2·base]` so the configured mean is
    /// preserved while correlated expiry is broken up. Variance is clamped
    /// into `[0, 1]`.
    #[must_use]
    pub fn final_ttl(&self, base_seconds: u64, randomize: bool, variance: f64) -> u64 {
        let variance = variance.clamp(0.0, 1.0);
        if !randomize || variance <= 0.0 || base_seconds == 0 {
            return base_seconds;
        }
        let g = clamped_standard_normal();
        #[allow(clippy::cast_precision_loss)]
        let offset = base_seconds as f64 * variance * g / 3.0;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (base_seconds as f64 + offset)
                .round()
                .clamp(1.0, 2.0 * base_seconds as f64) as u64
        }
    }

    /// Whether an entry created at `created_ms` with `ttl_seconds` is past
    /// its lifetime. Eternal entries (`ttl_seconds == 0`) never expire.
    #[must_use]
    pub fn is_expired(&self, created_ms: i64, ttl_seconds: u64) -> bool {
        if ttl_seconds == 0 {
            return false;
        }
        let elapsed_ms = self.clock.now_millis().saturating_sub(created_ms);
        elapsed_ms > i64::try_from(ttl_seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
    }

    /// Remaining lifetime in seconds; −1 for eternal entries, 0 when past
    /// expiry.
    #[must_use]
    pub fn remaining_ttl(&self, created_ms: i64, ttl_seconds: u64) -> i64 {
        if ttl_seconds == 0 {
            return -1;
        }
        let elapsed_secs = self.clock.now_millis().saturating_sub(created_ms) / 1_000;
        (i64::try_from(ttl_seconds).unwrap_or(i64::MAX) - elapsed_secs).max(0)
    }

    /// Whether an entry has entered its refresh window.
    ///
    /// The threshold is the fraction of total life remaining at which
    /// refresh triggers: with `threshold = 0.3`, refresh starts once 70% of
    /// the lifetime has elapsed. False for eternal entries and out-of-range
    /// thresholds.
    #[must_use]
    pub fn should_pre_refresh(&self, created_ms: i64, ttl_seconds: u64, threshold: f64) -> bool {
        if ttl_seconds == 0 || threshold <= 0.0 || threshold >= 1.0 {
            return false;
        }
        let elapsed_ms = self.clock.now_millis().saturating_sub(created_ms);
        if elapsed_ms < 0 {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = elapsed_ms as f64 / (ttl_seconds as f64 * 1_000.0);
        ratio >= 1.0 - threshold
    }
}

/// Standard normal draw clamped to `[-3, 3]`, via Box–Muller over the
/// thread-local uniform source.
fn clamped_standard_normal() -> f64 {
    let mut rng = rand::thread_rng();
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.r#gen();
    let g = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    g.clamp(-3.0, 3.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn policy_at(now_ms: i64) -> (TtlPolicy, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now_ms));
        (TtlPolicy::new(clock.clone()), clock)
    }

    #[test]
    fn should_apply_requires_positive_ttl() {
        assert!(TtlPolicy::should_apply(Some(1)));
        assert!(!TtlPolicy::should_apply(Some(0)));
        assert!(!TtlPolicy::should_apply(None));
    }

    #[test]
    fn jitter_stays_within_bounds_and_mean() {
        let (policy, _) = policy_at(0);
        let base = 300u64;
        let mut sum = 0u64;
        let draws = 10_000;
        for _ in 0..draws {
            let ttl = policy.final_ttl(base, true, 0.5);
            assert!((1..=2 * base).contains(&ttl), "ttl {ttl} out of bounds");
            sum += ttl;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = sum as f64 / f64::from(draws);
        let tolerance = base as f64 * 0.02;
        assert!(
            (mean - base as f64).abs() < tolerance,
            "mean {mean} drifted from base {base}"
        );
    }

    #[test]
    fn variance_is_clamped_into_unit_interval() {
        let (policy, _) = policy_at(0);
        for _ in 0..1_000 {
            let ttl = policy.final_ttl(100, true, 5.0);
            assert!((1..=200).contains(&ttl));
        }
    }

    #[test]
    fn no_jitter_without_randomize_or_variance() {
        let (policy, _) = policy_at(0);
        assert_eq!(policy.final_ttl(300, false, 0.5), 300);
        assert_eq!(policy.final_ttl(300, true, 0.0), 300);
        assert_eq!(policy.final_ttl(0, true, 0.5), 0);
    }

    #[test]
    fn expiry_tracks_the_clock() {
        let (policy, clock) = policy_at(0);
        assert!(!policy.is_expired(0, 100));
        clock.set(100_000);
        assert!(!policy.is_expired(0, 100)); // exactly at the boundary
        clock.set(100_001);
        assert!(policy.is_expired(0, 100));
        assert!(!policy.is_expired(0, 0)); // eternal
    }

    #[test]
    fn remaining_ttl_counts_down_to_zero() {
        let (policy, clock) = policy_at(40_000);
        assert_eq!(policy.remaining_ttl(0, 100), 60);
        clock.set(250_000);
        assert_eq!(policy.remaining_ttl(0, 100), 0);
        assert_eq!(policy.remaining_ttl(0, 0), -1);
    }

    #[test]
    fn pre_refresh_triggers_at_the_threshold() {
        // threshold 0.3 → refresh once 70% of life has elapsed
        let (policy, clock) = policy_at(69_999);
        assert!(!policy.should_pre_refresh(0, 100, 0.3));
        clock.set(70_000);
        assert!(policy.should_pre_refresh(0, 100, 0.3));
        clock.set(99_000);
        assert!(policy.should_pre_refresh(0, 100, 0.3));
    }

    #[test]
    fn pre_refresh_rejects_bad_inputs() {
        let (policy, _) = policy_at(90_000);
        assert!(!policy.should_pre_refresh(0, 0, 0.3)); // eternal
        assert!(!policy.should_pre_refresh(0, 100, 0.0));
        assert!(!policy.should_pre_refresh(0, 100, 1.0));
        assert!(!policy.should_pre_refresh(0, 100, -0.2));
    }
}

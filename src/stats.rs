//! Statistical routines for binomial arms
//!
//! Pure functions, no shared state: safe to call from any number of request
//! handlers at once. Two estimators live here:
//!
//! - Thompson sampling: one draw from the Beta posterior of an arm, using a
//!   Laplace-smoothed prior so untouched arms never produce Beta(0, 0).
//! - Wilson score interval: a closed-form confidence interval for a binomial
//!   proportion that stays well-behaved at small sample sizes.
//!
//! `trials == 0` is not an error anywhere in this module; every routine
//! returns a well-defined degenerate value instead.

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::constants::WILSON_Z_95;

/// Lower/upper bounds of a confidence interval on a rate in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    /// Width of the interval
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Whether `rate` falls inside the interval (inclusive)
    pub fn contains(&self, rate: f64) -> bool {
        rate >= self.lower && rate <= self.upper
    }
}

/// Beta posterior shape parameters for an arm with `successes` out of `trials`.
///
/// alpha = successes + 1, beta = max(1, trials - successes) + 1.
/// Counters are recorded independently, so `successes > trials` can occur;
/// the failure count saturates at zero before the floor of one is applied.
pub fn beta_posterior(successes: u64, trials: u64) -> (f64, f64) {
    let alpha = successes as f64 + 1.0;
    let failures = trials.saturating_sub(successes).max(1);
    let beta = failures as f64 + 1.0;
    (alpha, beta)
}

/// Mean of the Beta posterior, alpha / (alpha + beta)
pub fn posterior_mean(successes: u64, trials: u64) -> f64 {
    let (alpha, beta) = beta_posterior(successes, trials);
    alpha / (alpha + beta)
}

/// Draw one Thompson sample for an arm using the thread-local RNG
pub fn sample_thompson(successes: u64, trials: u64) -> f64 {
    sample_thompson_with(&mut rand::thread_rng(), successes, trials)
}

/// Draw one Thompson sample for an arm from the supplied RNG.
///
/// Seeded RNGs make selection reproducible in tests.
pub fn sample_thompson_with<R: Rng + ?Sized>(rng: &mut R, successes: u64, trials: u64) -> f64 {
    let (alpha, beta) = beta_posterior(successes, trials);
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng).clamp(0.0, 1.0),
        // Unreachable with alpha, beta >= 1; fall back to the mean rather than panic
        Err(_) => alpha / (alpha + beta),
    }
}

/// Wilson score interval at ~95% confidence (z = 1.96)
pub fn wilson_score(successes: u64, trials: u64) -> ConfidenceInterval {
    wilson_score_with_z(successes, trials, WILSON_Z_95)
}

/// Wilson score interval for an arbitrary z.
///
/// ```text
/// p̂      = s / n
/// denom  = 1 + z²/n
/// center = (p̂ + z²/(2n)) / denom
/// margin = z · sqrt((p̂(1 − p̂) + z²/(4n)) / n) / denom
/// ```
///
/// Bounds are clamped to [0, 1]. `trials == 0` yields `{0.0, 0.0}`.
pub fn wilson_score_with_z(successes: u64, trials: u64, z: f64) -> ConfidenceInterval {
    if trials == 0 {
        return ConfidenceInterval::default();
    }

    let n = trials as f64;
    let p_hat = successes as f64 / n;
    let z2 = z * z;

    let denominator = 1.0 + z2 / n;
    let center = (p_hat + z2 / (2.0 * n)) / denominator;
    // p̂ > 1 only when counters were recorded out of order; keep the radicand non-negative
    let variance = (p_hat * (1.0 - p_hat)).max(0.0) + z2 / (4.0 * n);
    let margin = z * (variance / n).sqrt() / denominator;

    ConfidenceInterval {
        lower: (center - margin).clamp(0.0, 1.0),
        upper: (center + margin).clamp(0.0, 1.0),
    }
}

/// Rate with the `max(1, trials)` denominator used for every reported rate
pub fn rate(count: u64, trials: u64) -> f64 {
    count as f64 / trials.max(1) as f64
}

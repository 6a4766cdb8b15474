//! Confidence bound formulas (§4.3). Only `"ttest"` is a real bound;
//! `"manual"` and `"random"` exist for debugging, exactly as the source
//! documents them ("not for production" for the latter).

use rand::Rng;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::BoundError;
use crate::stats::data_prep::Branch;
use crate::tree::interval::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundMethod {
    Ttest,
    Manual,
    Random,
}

impl std::str::FromStr for BoundMethod {
    type Err = BoundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ttest" => Ok(BoundMethod::Ttest),
            "manual" => Ok(BoundMethod::Manual),
            "random" => Ok(BoundMethod::Random),
            other => Err(BoundError::UnsupportedBoundMethod(other.to_string())),
        }
    }
}

/// Sample standard deviation (`ddof = 1`); `0.0` for fewer than two samples.
pub fn stddev(z: &[f64]) -> f64 {
    let n = z.len();
    if n < 2 {
        return 0.0;
    }
    let mean = z.iter().sum::<f64>() / n as f64;
    let sum_sq: f64 = z.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (n as f64 - 1.0)).sqrt()
}

/// Two-sided Student-t quantile `tinv(confidence, dof)`.
fn tinv(confidence: f64, dof: f64) -> Result<f64, BoundError> {
    let dist = StudentsT::new(0.0, 1.0, dof).map_err(|e| {
        BoundError::DomainError(format!("invalid Student-t degrees of freedom {}: {}", dof, e))
    })?;
    Ok(dist.inverse_cdf(confidence))
}

/// `mean(z) +/- factor * (stddev(z) / sqrt(n)) * tinv(1 - delta_eff, n - 1)`,
/// where `factor` is `2` on the candidate-selection branch (predict-to-pass)
/// and `1` on the safety-test branch, and `delta_eff` is `delta / 2` when
/// both sides are requested (two-sided) or `delta` when only one is.
///
/// Per §7's recovery policy, `std == 0` or `n < 2` is logged and treated as
/// unbounded on the affected side rather than failing the whole propagation.
pub fn ttest_bound(
    z: &[f64],
    delta: f64,
    branch: Branch,
    want_lower: bool,
    want_upper: bool,
) -> Result<Interval, BoundError> {
    let n = z.len();
    if n < 2 {
        log::warn!("numerically degenerate leaf: n={} < 2, treating as unbounded", n);
        return Ok(Interval::unbounded());
    }
    let s = stddev(z);
    if s == 0.0 {
        log::warn!("numerically degenerate leaf: stddev == 0, treating as unbounded");
        return Ok(Interval::unbounded());
    }
    let mean = z.iter().sum::<f64>() / n as f64;
    let two_sided = want_lower && want_upper;
    let delta_eff = if two_sided { delta / 2.0 } else { delta };
    let t = tinv(1.0 - delta_eff, (n - 1) as f64)?;
    let factor = match branch {
        Branch::CandidateSelection => 2.0,
        Branch::SafetyTest => 1.0,
    };
    let half_width = factor * (s / (n as f64).sqrt()) * t;
    let lower = if want_lower {
        mean - half_width
    } else {
        f64::NEG_INFINITY
    };
    let upper = if want_upper {
        mean + half_width
    } else {
        f64::INFINITY
    };
    Ok(Interval::new(lower, upper))
}

/// Debugging bound method: returns the node's own stored bounds verbatim.
pub fn manual_bound(stored_lower: f64, stored_upper: f64) -> Interval {
    Interval::new(stored_lower, stored_upper)
}

/// Debugging bound method explicitly flagged as "not for production" by
/// the source: arbitrary integers, independent of any data.
pub fn random_bound(rng: &mut impl Rng) -> Interval {
    let lower = rng.gen_range(-10..0) as f64;
    let upper = rng.gen_range(0..10) as f64;
    Interval::new(lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn stddev_of_constant_series_is_zero() {
        assert_eq!(stddev(&[1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn ttest_bound_degenerate_on_single_sample() {
        let got = ttest_bound(&[1.0], 0.05, Branch::SafetyTest, true, true).unwrap();
        assert_eq!(got, Interval::unbounded());
    }

    #[test]
    fn ttest_bound_degenerate_on_zero_variance() {
        let got = ttest_bound(&[2.0, 2.0, 2.0], 0.05, Branch::SafetyTest, true, true).unwrap();
        assert_eq!(got, Interval::unbounded());
    }

    #[test]
    fn candidate_branch_is_twice_as_wide_as_safety_branch() {
        let z: Vec<f64> = (0..100).map(|i| i as f64 * 0.01).collect();
        let safety = ttest_bound(&z, 0.05, Branch::SafetyTest, true, true).unwrap();
        let candidate = ttest_bound(&z, 0.05, Branch::CandidateSelection, true, true).unwrap();
        let safety_half_width = safety.upper - safety.lower;
        let candidate_half_width = candidate.upper - candidate.lower;
        assert_abs_diff_eq!(candidate_half_width, 2.0 * safety_half_width, epsilon = 1e-9);
    }

    #[test]
    fn one_sided_request_leaves_other_side_infinite() {
        let z: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let got = ttest_bound(&z, 0.05, Branch::SafetyTest, false, true).unwrap();
        assert_eq!(got.lower, f64::NEG_INFINITY);
        assert!(got.upper.is_finite());
    }

    #[test]
    fn manual_bound_passes_through_stored_values() {
        assert_eq!(manual_bound(-1.0, 1.0), Interval::new(-1.0, 1.0));
    }
}

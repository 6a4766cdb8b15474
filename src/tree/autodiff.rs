//! Reverse-mode gradient of the already-propagated root bound w.r.t. `theta`
//! (§9 design note (a)): "embed a small reverse-mode engine over the
//! interval propagator (gradients of `add/sub/mult/div/abs/exp/pow/min/max`
//! are closed-form except at kinks, where a subgradient is chosen)".
//!
//! This module never recomputes the *values* `propagate` already settled —
//! it reads the cached `node.lower`/`node.upper` and, for `mult`/`div`/`pow`/
//! `min`/`max`/`abs`, figures out which corner/operand produced that value
//! so the gradient it returns is consistent with the value the optimizer
//! will actually use. Constraints that route through the pairwise (`MED`)
//! leaf, or a `pow` whose exponent isn't a constant, have no supported
//! gradient here and surface as [`Option::None`] so the caller (the
//! gradient-descent optimization technique) can report
//! [`crate::error::DriverError::GradientUnavailable`] instead of silently
//! guessing.

use nalgebra::DVector;

use crate::catalog::Operator;
use crate::model::Model;
use crate::stats::{self, BoundMethod};

use super::node::TreeNode;
use super::{CacheSlot, CachedLeafData, PropagateArgs};

struct Grad {
    lower: Option<DVector<f64>>,
    upper: Option<DVector<f64>>,
}

impl Grad {
    fn unavailable() -> Self {
        Grad {
            lower: None,
            upper: None,
        }
    }

    fn zero(dim: usize) -> Self {
        Grad {
            lower: Some(DVector::zeros(dim)),
            upper: Some(DVector::zeros(dim)),
        }
    }
}

/// Gradient of `root.upper` w.r.t. `theta`, or `None` if some leaf the root
/// depends on does not support it.
pub fn root_upper_gradient(
    root: &TreeNode,
    cache: &std::collections::HashMap<String, CacheSlot>,
    model: &Model,
    args: &PropagateArgs,
) -> Option<DVector<f64>> {
    let dim = args.theta.len();
    grad_node(root, cache, model, args, dim).upper
}

fn grad_node(
    node: &TreeNode,
    cache: &std::collections::HashMap<String, CacheSlot>,
    model: &Model,
    args: &PropagateArgs,
    dim: usize,
) -> Grad {
    match node {
        TreeNode::Constant(_) => Grad::zero(dim),
        TreeNode::Base(b) => {
            let slot = match cache.get(&b.canonical_name()) {
                Some(s) if s.computed => s,
                _ => return Grad::unavailable(),
            };
            leaf_grad(b.measure, b.delta, b.will_lower_bound, b.will_upper_bound, slot, model, args, dim)
        }
        TreeNode::Internal(n) => {
            let a = grad_node(&n.left, cache, model, args, dim);
            let b = n.right.as_ref().map(|r| grad_node(r, cache, model, args, dim));
            combine(n.op, &n.left, n.right.as_deref(), a, b, dim)
        }
    }
}

fn leaf_grad(
    measure: crate::catalog::Measure,
    delta: f64,
    want_lower: bool,
    want_upper: bool,
    slot: &CacheSlot,
    model: &Model,
    args: &PropagateArgs,
    dim: usize,
) -> Grad {
    if args.bound_method != BoundMethod::Ttest {
        return Grad::zero(dim);
    }
    if measure.is_pairwise() {
        return Grad::unavailable();
    }
    let Some(gradient_sample) = model.gradient_sample.as_ref() else {
        return Grad::unavailable();
    };
    let CachedLeafData::Supervised(leaf) = slot
        .data
        .as_ref()
        .expect("propagate populates leaf data before marking computed")
    else {
        return Grad::unavailable();
    };
    if leaf.is_empty() {
        return Grad::zero(dim);
    }

    let z = (model.sample_from_statistic)(measure, args.theta, leaf);
    let gz = gradient_sample(measure, args.theta, leaf);
    let n = z.len();
    if n < 2 {
        return Grad::zero(dim);
    }
    let s = stats::stddev(&z);
    if s == 0.0 {
        return Grad::zero(dim);
    }

    let mean_grad = gz.iter().fold(DVector::zeros(dim), |acc, g| acc + g) / n as f64;
    let mean = z.iter().sum::<f64>() / n as f64;

    let mut s_grad = DVector::zeros(dim);
    for (zi, gi) in z.iter().zip(gz.iter()) {
        s_grad += (gi - &mean_grad) * (zi - mean);
    }
    s_grad *= 1.0 / ((n as f64 - 1.0) * s);

    let two_sided = want_lower && want_upper;
    let delta_eff = if two_sided { delta / 2.0 } else { delta };
    let t = match statrs_tinv(1.0 - delta_eff, (n - 1) as f64) {
        Some(t) => t,
        None => return Grad::zero(dim),
    };
    let factor = match args.branch {
        stats::Branch::CandidateSelection => 2.0,
        stats::Branch::SafetyTest => 1.0,
    };
    let half_width_grad = &s_grad * (factor * t / (n as f64).sqrt());

    Grad {
        lower: if want_lower {
            Some(&mean_grad - &half_width_grad)
        } else {
            None
        },
        upper: if want_upper {
            Some(&mean_grad + &half_width_grad)
        } else {
            None
        },
    }
}

fn statrs_tinv(confidence: f64, dof: f64) -> Option<f64> {
    use statrs::distribution::{ContinuousCDF, StudentsT};
    StudentsT::new(0.0, 1.0, dof)
        .ok()
        .map(|dist| dist.inverse_cdf(confidence))
}

fn combine(
    op: Operator,
    left: &TreeNode,
    right: Option<&TreeNode>,
    a: Grad,
    b: Option<Grad>,
    dim: usize,
) -> Grad {
    let a_val = left.interval();
    let b_val = right.map(|r| r.interval());
    match op {
        Operator::Add => Grad {
            lower: zip_add(a.lower, b.as_ref().and_then(|g| g.lower.clone())),
            upper: zip_add(a.upper, b.as_ref().and_then(|g| g.upper.clone())),
        },
        Operator::Sub => Grad {
            // node.upper = a.upper - b.lower; node.lower = a.lower - b.upper
            upper: zip_sub(a.upper, b.as_ref().and_then(|g| g.lower.clone())),
            lower: zip_sub(a.lower, b.as_ref().and_then(|g| g.upper.clone())),
        },
        Operator::Mult => {
            let b_val = b_val.expect("mult has a right child");
            let b = b.expect("mult has a right child");
            corner_grad_mult(a_val, b_val, &a, &b, dim)
        }
        Operator::Div => {
            let b_val = b_val.expect("div has a right child");
            let b = b.expect("div has a right child");
            corner_grad_div(a_val, b_val, &a, &b, dim)
        }
        Operator::Pow => {
            let b_val = b_val.expect("pow has a right child");
            match right {
                Some(TreeNode::Constant(c)) => corner_grad_pow_const_exp(a_val, c.value, &a, dim),
                _ => {
                    let _ = b_val;
                    Grad::unavailable()
                }
            }
        }
        Operator::Min => select_grad(a_val, b_val.expect("min has a right child"), &a, &b.expect("min has a right child"), f64::min),
        Operator::Max => select_grad(a_val, b_val.expect("max has a right child"), &a, &b.expect("max has a right child"), f64::max),
        Operator::Abs => abs_grad(a_val, &a, dim),
        Operator::Exp => Grad {
            lower: a.lower.map(|g| &g * a_val.lower.exp()),
            upper: a.upper.map(|g| &g * a_val.upper.exp()),
        },
    }
}

fn zip_add(a: Option<DVector<f64>>, b: Option<DVector<f64>>) -> Option<DVector<f64>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        _ => None,
    }
}

fn zip_sub(a: Option<DVector<f64>>, b: Option<DVector<f64>>) -> Option<DVector<f64>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}

fn closest_corner(target: f64, candidates: &[f64]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| (*x - target).abs().partial_cmp(&(*y - target).abs()).unwrap())
        .map(|(i, _)| i)
        .unwrap()
}

fn corner_grad_mult(
    a_val: crate::tree::interval::Interval,
    b_val: crate::tree::interval::Interval,
    a: &Grad,
    b: &Grad,
    dim: usize,
) -> Grad {
    let corners = [
        (a_val.lower, b_val.lower, a.lower.as_ref(), b.lower.as_ref()),
        (a_val.lower, b_val.upper, a.lower.as_ref(), b.upper.as_ref()),
        (a_val.upper, b_val.lower, a.upper.as_ref(), b.lower.as_ref()),
        (a_val.upper, b_val.upper, a.upper.as_ref(), b.upper.as_ref()),
    ];
    let values: Vec<f64> = corners.iter().map(|(x, y, _, _)| x * y).collect();
    let target_upper = *values
        .iter()
        .max_by(|x, y| x.partial_cmp(y).unwrap())
        .unwrap();
    let target_lower = *values
        .iter()
        .min_by(|x, y| x.partial_cmp(y).unwrap())
        .unwrap();
    let upper = product_grad_at(&corners, &values, target_upper, dim);
    let lower = product_grad_at(&corners, &values, target_lower, dim);
    Grad { lower, upper }
}

type Corner<'a> = (f64, f64, Option<&'a DVector<f64>>, Option<&'a DVector<f64>>);

fn product_grad_at(corners: &[Corner], values: &[f64], target: f64, dim: usize) -> Option<DVector<f64>> {
    let idx = closest_corner(target, values);
    let (x, y, gx, gy) = corners[idx];
    match (gx, gy) {
        (Some(gx), Some(gy)) => Some(gx * y + gy * x),
        _ => Some(DVector::zeros(dim)),
    }
}

fn corner_grad_div(
    a_val: crate::tree::interval::Interval,
    b_val: crate::tree::interval::Interval,
    a: &Grad,
    b: &Grad,
    dim: usize,
) -> Grad {
    if b_val.lower < 0.0 && b_val.upper > 0.0 {
        return Grad::zero(dim);
    }
    let (recip_lo, recip_hi, grad_recip_lo, grad_recip_hi) = if b_val.upper == 0.0 {
        (
            f64::NEG_INFINITY,
            1.0 / b_val.lower,
            None,
            b.lower.as_ref().map(|g| -g / (b_val.lower * b_val.lower)),
        )
    } else if b_val.lower == 0.0 {
        (
            1.0 / b_val.upper,
            f64::INFINITY,
            b.upper.as_ref().map(|g| -g / (b_val.upper * b_val.upper)),
            None,
        )
    } else {
        (
            1.0 / b_val.upper,
            1.0 / b_val.lower,
            b.upper.as_ref().map(|g| -g / (b_val.upper * b_val.upper)),
            b.lower.as_ref().map(|g| -g / (b_val.lower * b_val.lower)),
        )
    };
    let recip_val = crate::tree::interval::Interval::new(recip_lo, recip_hi);
    let recip_grad = Grad {
        lower: grad_recip_lo,
        upper: grad_recip_hi,
    };
    corner_grad_mult(a_val, recip_val, a, &recip_grad, dim)
}

fn corner_grad_pow_const_exp(
    a_val: crate::tree::interval::Interval,
    p: f64,
    a: &Grad,
    dim: usize,
) -> Grad {
    if a_val.lower < 0.0 || (a_val.contains_zero() && p < 1.0) {
        return Grad::unavailable();
    }
    let lo_val = a_val.lower.powf(p);
    let hi_val = a_val.upper.powf(p);
    let make = |target: f64| -> Option<DVector<f64>> {
        let (x, gx) = if (lo_val - target).abs() <= (hi_val - target).abs() {
            (a_val.lower, a.lower.as_ref())
        } else {
            (a_val.upper, a.upper.as_ref())
        };
        gx.map(|g| g * (p * x.powf(p - 1.0)))
            .or(Some(DVector::zeros(dim)))
    };
    let upper = make(lo_val.max(hi_val));
    let lower = make(lo_val.min(hi_val));
    Grad { lower, upper }
}

fn select_grad(
    a_val: crate::tree::interval::Interval,
    b_val: crate::tree::interval::Interval,
    a: &Grad,
    b: &Grad,
    pick: fn(f64, f64) -> f64,
) -> Grad {
    let lower = if pick(a_val.lower, b_val.lower) == a_val.lower {
        a.lower.clone()
    } else {
        b.lower.clone()
    };
    let upper = if pick(a_val.upper, b_val.upper) == a_val.upper {
        a.upper.clone()
    } else {
        b.upper.clone()
    };
    Grad { lower, upper }
}

/// Gradient of `|corner_val|` given the corner's own value and gradient:
/// `+g` when the corner is non-negative, `-g` when it's negative.
fn signed_corner_grad(corner_val: f64, corner_grad: &Option<DVector<f64>>) -> Option<DVector<f64>> {
    corner_grad
        .as_ref()
        .map(|g| if corner_val < 0.0 { -g } else { g.clone() })
}

fn abs_grad(a_val: crate::tree::interval::Interval, a: &Grad, dim: usize) -> Grad {
    let upper = if a_val.lower.abs() >= a_val.upper.abs() {
        signed_corner_grad(a_val.lower, &a.lower)
    } else {
        signed_corner_grad(a_val.upper, &a.upper)
    }
    .or(Some(DVector::zeros(dim)));

    let lower = if a_val.lower.signum() == a_val.upper.signum() {
        if a_val.lower.abs() <= a_val.upper.abs() {
            signed_corner_grad(a_val.lower, &a.lower)
        } else {
            signed_corner_grad(a_val.upper, &a.upper)
        }
        .or(Some(DVector::zeros(dim)))
    } else {
        Some(DVector::zeros(dim))
    };

    Grad { lower, upper }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::interval::Interval;

    fn grad(value: f64) -> Grad {
        Grad {
            lower: Some(DVector::from_vec(vec![value])),
            upper: Some(DVector::from_vec(vec![value])),
        }
    }

    #[test]
    fn abs_grad_both_positive_does_not_flip_sign() {
        // lower=2, upper=5, both >= 0: d|lower|/dtheta = d(lower)/dtheta,
        // unnegated, since the interval's own lower is already non-negative.
        let a_val = Interval::new(2.0, 5.0);
        let a = grad(3.0);
        let result = abs_grad(a_val, &a, 1);
        assert_eq!(result.lower.unwrap()[0], 3.0);
        assert_eq!(result.upper.unwrap()[0], 3.0);
    }

    #[test]
    fn abs_grad_both_negative_flips_both_corners() {
        // lower=-5, upper=-2, both <= 0: |lower|=5 (upper-magnitude corner,
        // unnegated since the raw value -5 feeds abs's upper through -lower,
        // i.e. the "upper" slot picks the lower corner and negates it), and
        // |upper|=2 is the interval's own "lower" (min-magnitude) slot, built
        // from the upper corner negated since upper <= 0.
        let a_val = Interval::new(-5.0, -2.0);
        let a = grad(3.0);
        let result = abs_grad(a_val, &a, 1);
        assert_eq!(result.upper.unwrap()[0], -3.0);
        assert_eq!(result.lower.unwrap()[0], -3.0);
    }

    #[test]
    fn abs_grad_straddling_zero_lower_is_zero() {
        let a_val = Interval::new(-3.0, 4.0);
        let a = grad(3.0);
        let result = abs_grad(a_val, &a, 1);
        assert_eq!(result.lower.unwrap()[0], 0.0);
        assert_eq!(result.upper.unwrap()[0], 3.0);
    }
}

//! The duck-typed model interface (§9 "Duck-typed model interface"): a
//! record of function pointers rather than a class hierarchy, so the tree
//! and driver depend only on this capability set and never on a concrete
//! model identity. Per spec.md's "No model zoo" non-goal, this crate does
//! not ship any built-in `Model` construction (logistic/linear regression,
//! a policy-gradient RL model, ...) — callers build one from their own
//! `predict`/`fit` and hand it to [`crate::driver`].

use nalgebra::DVector;

use crate::catalog::Measure;
use crate::data::Dataset;
use crate::stats::data_prep::LeafData;

/// Capability set a model exposes to the core. `gradient_sample` is the
/// per-statistic analogue of `nodes.py`'s `gradient_<name>` reflection,
/// resolved at construction time per §9's "Reflection on loss names" note
/// instead of by name lookup: a model either supplies it (enabling the
/// gradient-descent-with-duals technique) or leaves it `None` (barrier
/// method only).
pub struct Model {
    /// `predict(theta, X) -> y_hat`, one prediction per row of `X`.
    pub predict: Box<dyn Fn(&DVector<f64>, &[Vec<f64>]) -> Vec<f64>>,
    /// `fit(X, y) -> theta_0`, the initial-solution builder.
    pub fit: Box<dyn Fn(&[Vec<f64>], &[f64]) -> DVector<f64>>,
    /// Mean of the named statistic over `data` at `theta`.
    pub evaluate_statistic: Box<dyn Fn(Measure, &DVector<f64>, &LeafData) -> f64>,
    /// Per-example unbiased contributions whose mean equals `evaluate_statistic`.
    pub sample_from_statistic: Box<dyn Fn(Measure, &DVector<f64>, &LeafData) -> Vec<f64>>,
    /// Per-example gradient (w.r.t. `theta`) of each contribution
    /// `sample_from_statistic` returns, needed only by the gradient-descent
    /// optimization technique's chain rule through the operator tree.
    pub gradient_sample:
        Option<Box<dyn Fn(Measure, &DVector<f64>, &LeafData) -> Vec<DVector<f64>>>>,
}

impl Model {
    pub fn supports_gradient(&self) -> bool {
        self.gradient_sample.is_some()
    }
}

/// The primary (loss) objective the driver minimizes outside of the
/// behavioral constraints, explicit-field per §9 rather than resolved by a
/// textual loss name.
pub enum PrimaryObjective {
    Supervised {
        loss_fn: Box<dyn Fn(&Model, &DVector<f64>, &[Vec<f64>], &[f64]) -> f64>,
        loss_grad: Option<Box<dyn Fn(&Model, &DVector<f64>, &[Vec<f64>], &[f64]) -> DVector<f64>>>,
    },
    ReinforcementLearning {
        /// `loss_fn(model, theta, dataset)`, e.g. the negative importance-weighted
        /// return of the candidate policy; the driver negates/regularizes per
        /// §4.5 ("want to maximize the importance weight").
        loss_fn: Box<dyn Fn(&Model, &DVector<f64>, &Dataset) -> f64>,
        loss_grad: Option<Box<dyn Fn(&Model, &DVector<f64>, &Dataset) -> DVector<f64>>>,
    },
}

impl PrimaryObjective {
    pub fn supports_gradient(&self) -> bool {
        match self {
            PrimaryObjective::Supervised { loss_grad, .. } => loss_grad.is_some(),
            PrimaryObjective::ReinforcementLearning { loss_grad, .. } => loss_grad.is_some(),
        }
    }
}

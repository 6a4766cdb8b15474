//! Selection driver (C5): dataset split, the scoring function that folds
//! constraint violation into the primary objective (§4.5), both
//! optimization techniques, the safety test, and the exit contract.

use nalgebra::DVector;
use rand::Rng;

use crate::data::{Dataset, RegimeParams, Split};
use crate::error::DriverError;
use crate::model::{Model, PrimaryObjective};
use crate::optimizer::{self, Evaluation, OptimizationTechnique, OptimizerConfig};
use crate::stats::{self, Branch, BoundMethod, LeafDataKind};
use crate::tree::{ParseTree, PropagateArgs};

/// Overridden onto the score once any constraint is predicted to fail
/// (§4.5 "overwrite `S` with a large constant").
const BIG: f64 = 1e5;

/// The driver's exit contract (§6, §7 `NoSolutionFound`).
#[derive(Debug, Clone)]
pub enum Solution {
    Found(DVector<f64>),
    NoSolutionFound,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Fraction of the dataset reserved for the safety split (§4.5, default 0.6).
    pub frac_safety: f64,
    pub bound_method: BoundMethod,
    pub technique: OptimizationTechnique,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            frac_safety: 0.6,
            bound_method: BoundMethod::Ttest,
            technique: OptimizationTechnique::Barrier,
        }
    }
}

/// Candidate-split data the primary objective is evaluated against, built
/// once per run and reused on every optimizer iteration.
enum PrimaryData {
    Supervised { features: Vec<Vec<f64>>, labels: Vec<f64> },
    ReinforcementLearning(Dataset),
}

fn prepare_primary_data(dataset: &Dataset, split: Split, regime_params: RegimeParams) -> PrimaryData {
    match regime_params {
        RegimeParams::Supervised => {
            let leaf = stats::prepare_supervised_leaf(dataset, split, &[], Branch::SafetyTest, 0);
            match leaf.kind {
                LeafDataKind::Supervised { features, labels } => {
                    PrimaryData::Supervised { features, labels }
                }
                LeafDataKind::ReinforcementLearning { .. } => unreachable!(
                    "prepare_supervised_leaf always returns a Supervised LeafDataKind"
                ),
            }
        }
        RegimeParams::ReinforcementLearning { .. } => {
            PrimaryData::ReinforcementLearning(dataset.subset(split))
        }
    }
}

fn initial_theta(primary_data: &PrimaryData, model: &Model) -> DVector<f64> {
    match primary_data {
        PrimaryData::Supervised { features, labels } => (model.fit)(features, labels),
        PrimaryData::ReinforcementLearning(_) => (model.fit)(&[], &[]),
    }
}

/// `primary(theta)` on the candidate data, matching `primary_data`'s regime
/// to `primary`'s. A caller pairing a supervised primary objective with
/// reinforcement-learning regime params (or vice versa) is a configuration
/// bug, reported the same way an unsupported regime string would be.
fn primary_value(
    primary: &PrimaryObjective,
    model: &Model,
    theta: &DVector<f64>,
    primary_data: &PrimaryData,
) -> Result<f64, DriverError> {
    match (primary, primary_data) {
        (PrimaryObjective::Supervised { loss_fn, .. }, PrimaryData::Supervised { features, labels }) => {
            Ok(loss_fn(model, theta, features, labels))
        }
        (
            PrimaryObjective::ReinforcementLearning { loss_fn, .. },
            PrimaryData::ReinforcementLearning(dataset),
        ) => Ok(loss_fn(model, theta, dataset)),
        _ => Err(DriverError::UnsupportedRegime(
            "primary objective regime does not match the dataset's regime".to_string(),
        )),
    }
}

fn primary_gradient(
    primary: &PrimaryObjective,
    model: &Model,
    theta: &DVector<f64>,
    primary_data: &PrimaryData,
) -> Result<DVector<f64>, DriverError> {
    match (primary, primary_data) {
        (
            PrimaryObjective::Supervised { loss_grad: Some(g), .. },
            PrimaryData::Supervised { features, labels },
        ) => Ok(g(model, theta, features, labels)),
        (
            PrimaryObjective::ReinforcementLearning { loss_grad: Some(g), .. },
            PrimaryData::ReinforcementLearning(dataset),
        ) => Ok(g(model, theta, dataset)),
        _ => Err(DriverError::GradientUnavailable),
    }
}

/// Resets and propagates every tree in the candidate branch, folding
/// `primary` and each tree's root upper bound into the barrier score
/// exactly per §4.5: the first violating tree overwrites the score with
/// `BIG`, and every violating tree's upper bound is added on top.
fn score(
    theta: &DVector<f64>,
    dataset: &Dataset,
    candidate_split: Split,
    regime_params: RegimeParams,
    model: &Model,
    primary: &PrimaryObjective,
    primary_data: &PrimaryData,
    trees: &mut [ParseTree],
    bound_method: BoundMethod,
    n_safety: usize,
    rng: &mut impl Rng,
) -> f64 {
    let mut total = match primary_value(primary, model, theta, primary_data) {
        Ok(v) => v,
        Err(e) => {
            log::error!("primary objective evaluation failed: {}", e);
            return BIG * 10.0;
        }
    };
    let mut predict_fail = false;
    for tree in trees.iter_mut() {
        tree.reset(false);
        let args = PropagateArgs {
            theta,
            dataset,
            split: candidate_split,
            model,
            bound_method,
            branch: Branch::CandidateSelection,
            n_safety,
            regime_params,
        };
        if let Err(e) = tree.propagate(&args, rng) {
            log::error!("candidate propagation failed: {}", e);
            return BIG * 10.0;
        }
        let upper = tree.root_upper();
        if upper > 0.0 {
            if !predict_fail {
                total = BIG;
                predict_fail = true;
            }
            total += upper;
        }
    }
    total
}

/// Runs the Seldonian algorithm's full state machine (§4.5): split, build
/// `theta0`, optimize (barrier or gradient-descent-with-duals), then
/// re-propagate every tree against the held-out safety split.
pub fn seldonian_algorithm(
    dataset: &Dataset,
    regime_params: RegimeParams,
    model: &Model,
    primary: &PrimaryObjective,
    trees: &mut [ParseTree],
    optimizer_config: &OptimizerConfig,
    driver_config: &DriverConfig,
    initial_solution: Option<DVector<f64>>,
    rng: &mut impl Rng,
) -> Result<(bool, Solution), DriverError> {
    let (candidate_split, safety_split) = dataset.split_candidate_safety(driver_config.frac_safety);
    let n_safety = safety_split.len();
    let primary_data = prepare_primary_data(dataset, candidate_split, regime_params);

    let theta0 = initial_solution.unwrap_or_else(|| initial_theta(&primary_data, model));

    log::info!(
        "candidate selection: {} constraint tree(s), n_candidate={}, n_safety={}",
        trees.len(),
        candidate_split.len(),
        n_safety
    );

    let theta = match driver_config.technique {
        OptimizationTechnique::Barrier => Some(optimizer::barrier_search(
            &theta0,
            optimizer_config,
            |theta| {
                score(
                    theta,
                    dataset,
                    candidate_split,
                    regime_params,
                    model,
                    primary,
                    &primary_data,
                    trees,
                    driver_config.bound_method,
                    n_safety,
                    rng,
                )
            },
        )),
        OptimizationTechnique::GradientDescent => {
            if trees.len() != 1 {
                return Err(DriverError::UnsupportedOptimizer(
                    "gradient-descent-with-dual-ascent supports exactly one constraint tree".to_string(),
                ));
            }
            if !primary.supports_gradient() {
                return Err(DriverError::GradientUnavailable);
            }
            optimizer::gradient_descent_dual_ascent(&theta0, optimizer_config, |theta| {
                let primary_val = primary_value(primary, model, theta, &primary_data)?;
                let primary_grad = primary_gradient(primary, model, theta, &primary_data)?;

                let tree = &mut trees[0];
                tree.reset(false);
                let args = PropagateArgs {
                    theta,
                    dataset,
                    split: candidate_split,
                    model,
                    bound_method: driver_config.bound_method,
                    branch: Branch::CandidateSelection,
                    n_safety,
                    regime_params,
                };
                tree.propagate(&args, rng)?;
                let upper = tree.root_upper();
                let upper_grad = tree.gradient_upper(&args).ok_or(DriverError::GradientUnavailable)?;

                Ok(Evaluation {
                    primary: primary_val,
                    primary_grad,
                    upper,
                    upper_grad,
                })
            })?
        }
    };

    let Some(theta) = theta else {
        log::warn!("optimization completed without a feasible iterate");
        return Ok((false, Solution::NoSolutionFound));
    };

    for tree in trees.iter_mut() {
        tree.reset(true);
        let args = PropagateArgs {
            theta: &theta,
            dataset,
            split: safety_split,
            model,
            bound_method: driver_config.bound_method,
            branch: Branch::SafetyTest,
            n_safety,
            regime_params,
        };
        tree.propagate(&args, rng)?;
    }
    let passed = trees.iter().all(|t| t.root_upper() <= 0.0);
    if passed {
        log::info!("safety test passed");
    } else {
        log::warn!("candidate predicted to pass but failed the safety test");
    }
    Ok((passed, Solution::Found(theta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DatasetMetadata;
    use crate::stats::LeafData;

    fn logistic_model() -> Model {
        Model {
            predict: Box::new(|theta, x| {
                x.iter()
                    .map(|row| {
                        let z: f64 = row.iter().zip(theta.iter()).map(|(a, b)| a * b).sum();
                        1.0 / (1.0 + (-z).exp())
                    })
                    .collect()
            }),
            fit: Box::new(|x, _y| DVector::from_element(x.first().map_or(1, |r| r.len()), 0.0)),
            evaluate_statistic: Box::new(|_m, theta, leaf: &LeafData| {
                let preds = sample(theta, leaf);
                preds.iter().sum::<f64>() / preds.len().max(1) as f64
            }),
            sample_from_statistic: Box::new(|_m, theta, leaf: &LeafData| sample(theta, leaf)),
            gradient_sample: None,
        }
    }

    fn sample(theta: &DVector<f64>, leaf: &LeafData) -> Vec<f64> {
        match &leaf.kind {
            crate::stats::LeafDataKind::Supervised { features, .. } => features
                .iter()
                .map(|row| {
                    let z: f64 = row.iter().zip(theta.iter()).map(|(a, b)| a * b).sum();
                    if 1.0 / (1.0 + (-z).exp()) >= 0.5 {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
            crate::stats::LeafDataKind::ReinforcementLearning { normalized_returns } => {
                normalized_returns.clone()
            }
        }
    }

    fn synthetic_dataset() -> Dataset {
        let meta = DatasetMetadata {
            regime: crate::data::Regime::SupervisedLearning,
            sub_regime: None,
            columns: vec!["M".to_string(), "F".to_string(), "X".to_string(), "Y".to_string()],
            sensitive_columns: vec!["M".to_string(), "F".to_string()],
            label_column: Some("Y".to_string()),
            include_sensitive_columns: false,
            include_intercept_term: true,
            episode_index_column: None,
            reward_column: None,
        };
        let mut rows = Vec::new();
        for i in 0..400 {
            let male = i % 2 == 0;
            rows.push(vec![
                if male { 1.0 } else { 0.0 },
                if male { 0.0 } else { 1.0 },
                (i as f64 * 0.01).sin(),
                if i % 3 == 0 { 1.0 } else { 0.0 },
            ]);
        }
        Dataset { metadata: meta, rows }
    }

    #[test]
    fn barrier_driver_runs_to_completion_on_a_trivial_constraint() {
        let dataset = synthetic_dataset();
        let model = logistic_model();
        let primary = PrimaryObjective::Supervised {
            loss_fn: Box::new(|_model, _theta, _features, _labels| 0.0),
            loss_grad: None,
        };
        let mut trees = vec![ParseTree::build(
            "abs((PR | [M]) - (PR | [F])) - 5.0",
            0.05,
            &["M".to_string(), "F".to_string()],
        )
        .unwrap()];
        let optimizer_config = OptimizerConfig {
            num_iters: 10,
            ..OptimizerConfig::default()
        };
        let driver_config = DriverConfig::default();
        let mut rng = rand::thread_rng();
        let (passed, solution) = seldonian_algorithm(
            &dataset,
            RegimeParams::Supervised,
            &model,
            &primary,
            &mut trees,
            &optimizer_config,
            &driver_config,
            Some(DVector::from_vec(vec![0.0, 0.0])),
            &mut rng,
        )
        .unwrap();
        assert!(passed);
        assert!(matches!(solution, Solution::Found(_)));
    }

    #[test]
    fn barrier_driver_reports_failure_when_safety_test_cannot_be_met() {
        // An impossibly tight constraint (every positive-rate gap must be
        // under 1e-9) on a dataset with a real gap between groups: no theta
        // clears the safety test, so the driver must report `passed = false`
        // rather than papering over the failed constraint.
        let dataset = synthetic_dataset();
        let model = logistic_model();
        let primary = PrimaryObjective::Supervised {
            loss_fn: Box::new(|_model, _theta, _features, _labels| 0.0),
            loss_grad: None,
        };
        let mut trees = vec![ParseTree::build(
            "abs((PR | [M]) - (PR | [F])) - 0.0000001",
            0.05,
            &["M".to_string(), "F".to_string()],
        )
        .unwrap()];
        let optimizer_config = OptimizerConfig {
            num_iters: 5,
            ..OptimizerConfig::default()
        };
        let driver_config = DriverConfig::default();
        let mut rng = rand::thread_rng();
        let (passed, solution) = seldonian_algorithm(
            &dataset,
            RegimeParams::Supervised,
            &model,
            &primary,
            &mut trees,
            &optimizer_config,
            &driver_config,
            Some(DVector::from_vec(vec![0.0, 0.0])),
            &mut rng,
        )
        .unwrap();
        assert!(!passed);
        assert!(matches!(solution, Solution::Found(_) | Solution::NoSolutionFound));
    }

    fn rl_dataset() -> Dataset {
        let meta = DatasetMetadata {
            regime: crate::data::Regime::ReinforcementLearning,
            sub_regime: None,
            columns: vec!["episode_index".to_string(), "R".to_string()],
            sensitive_columns: vec![],
            label_column: None,
            include_sensitive_columns: false,
            include_intercept_term: false,
            episode_index_column: Some("episode_index".to_string()),
            reward_column: Some("R".to_string()),
        };
        let mut rows = Vec::new();
        for episode in 0..200i64 {
            let reward = if episode % 2 == 0 { 1.0 } else { 0.0 };
            rows.push(vec![episode as f64, reward]);
        }
        Dataset { metadata: meta, rows }
    }

    fn rl_model() -> Model {
        Model {
            predict: Box::new(|_theta, _x| Vec::new()),
            fit: Box::new(|_x, _y| DVector::from_vec(vec![0.0])),
            evaluate_statistic: Box::new(|_m, _t, leaf| match &leaf.kind {
                crate::stats::LeafDataKind::ReinforcementLearning { normalized_returns } => {
                    normalized_returns.iter().sum::<f64>() / normalized_returns.len().max(1) as f64
                }
                crate::stats::LeafDataKind::Supervised { .. } => unreachable!(),
            }),
            sample_from_statistic: Box::new(|_m, _t, leaf| match &leaf.kind {
                crate::stats::LeafDataKind::ReinforcementLearning { normalized_returns } => {
                    normalized_returns.clone()
                }
                crate::stats::LeafDataKind::Supervised { .. } => unreachable!(),
            }),
            gradient_sample: None,
        }
    }

    #[test]
    fn barrier_driver_runs_reinforcement_learning_regime_to_completion() {
        let dataset = rl_dataset();
        let model = rl_model();
        let primary = PrimaryObjective::ReinforcementLearning {
            loss_fn: Box::new(|_model, _theta, _dataset| 0.0),
            loss_grad: None,
        };
        let mut trees = vec![ParseTree::build("PR - 2.0", 0.05, &[]).unwrap()];
        let optimizer_config = OptimizerConfig {
            num_iters: 5,
            ..OptimizerConfig::default()
        };
        let driver_config = DriverConfig::default();
        let regime_params = RegimeParams::ReinforcementLearning {
            gamma: 1.0,
            min_return: 0.0,
            max_return: 1.0,
        };
        let mut rng = rand::thread_rng();
        let (passed, solution) = seldonian_algorithm(
            &dataset,
            regime_params,
            &model,
            &primary,
            &mut trees,
            &optimizer_config,
            &driver_config,
            Some(DVector::from_vec(vec![0.0])),
            &mut rng,
        )
        .unwrap();
        assert!(passed);
        assert!(matches!(solution, Solution::Found(_)));
    }

    #[test]
    fn gradient_descent_technique_rejects_multiple_trees() {
        let dataset = synthetic_dataset();
        let model = logistic_model();
        let primary = PrimaryObjective::Supervised {
            loss_fn: Box::new(|_model, _theta, _features, _labels| 0.0),
            loss_grad: Some(Box::new(|_model, theta, _features, _labels| {
                DVector::zeros(theta.len())
            })),
        };
        let mut trees = vec![
            ParseTree::build("abs((PR | [M]) - (PR | [F])) - 0.15", 0.05, &["M".to_string(), "F".to_string()]).unwrap(),
            ParseTree::build("abs((PR | [M]) - (PR | [F])) - 0.20", 0.05, &["M".to_string(), "F".to_string()]).unwrap(),
        ];
        let optimizer_config = OptimizerConfig::default();
        let driver_config = DriverConfig {
            technique: OptimizationTechnique::GradientDescent,
            ..DriverConfig::default()
        };
        let mut rng = rand::thread_rng();
        let err = seldonian_algorithm(
            &dataset,
            RegimeParams::Supervised,
            &model,
            &primary,
            &mut trees,
            &optimizer_config,
            &driver_config,
            Some(DVector::from_vec(vec![0.0, 0.0])),
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedOptimizer(_)));
    }
}

//! Optimization techniques (§4.5, §9 "Configuration objects"): a
//! hand-rolled Nelder-Mead barrier-method minimizer (the pack has no
//! derivative-free optimization crate, so none is fabricated here) and the
//! Adam gradient-descent-with-dual-ascent technique. Neither function knows
//! about datasets, models, or parse trees — [`crate::driver`] supplies the
//! scoring/evaluation closures.

use nalgebra::DVector;

use crate::error::DriverError;

/// Recognized optimizer hyperparameters (§6, §9 "Configuration objects").
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub lambda_init: f64,
    pub alpha_theta: f64,
    pub alpha_lamb: f64,
    pub beta_velocity: f64,
    pub beta_rmsprop: f64,
    pub num_iters: usize,
    pub verbose: bool,
    /// Reserved field, carried through but not acted on (§6).
    pub hyper_search: bool,
    /// Informational field, carried through but not acted on (§6).
    pub gradient_library: String,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            lambda_init: 0.5,
            alpha_theta: 0.05,
            alpha_lamb: 0.05,
            beta_velocity: 0.9,
            beta_rmsprop: 0.999,
            num_iters: 200,
            verbose: false,
            hyper_search: false,
            gradient_library: "autodiff".to_string(),
        }
    }
}

/// A recognized-field value, for building an [`OptimizerConfig`] from an
/// externally supplied field list (e.g. deserialized JSON) without adding a
/// `serde` dependency the rest of the crate has no other use for.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl OptimizerConfig {
    const RECOGNIZED: &'static [&'static str] = &[
        "lambda_init",
        "alpha_theta",
        "alpha_lamb",
        "beta_velocity",
        "beta_rmsprop",
        "num_iters",
        "verbose",
        "hyper_search",
        "gradient_library",
    ];

    /// Builds a config from `(field, value)` pairs, rejecting any field
    /// outside the recognized set (§9 "unknown fields should be rejected").
    pub fn from_fields(fields: &[(String, ConfigValue)]) -> Result<Self, DriverError> {
        let unknown: Vec<String> = fields
            .iter()
            .filter(|(name, _)| !Self::RECOGNIZED.contains(&name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();
        if !unknown.is_empty() {
            return Err(DriverError::UnknownConfigField(unknown));
        }
        let mut config = OptimizerConfig::default();
        for (name, value) in fields {
            match (name.as_str(), value) {
                ("lambda_init", ConfigValue::Float(v)) => config.lambda_init = *v,
                ("alpha_theta", ConfigValue::Float(v)) => config.alpha_theta = *v,
                ("alpha_lamb", ConfigValue::Float(v)) => config.alpha_lamb = *v,
                ("beta_velocity", ConfigValue::Float(v)) => config.beta_velocity = *v,
                ("beta_rmsprop", ConfigValue::Float(v)) => config.beta_rmsprop = *v,
                ("num_iters", ConfigValue::Int(v)) => config.num_iters = (*v).max(0) as usize,
                ("verbose", ConfigValue::Bool(v)) => config.verbose = *v,
                ("hyper_search", ConfigValue::Bool(v)) => config.hyper_search = *v,
                ("gradient_library", ConfigValue::Text(v)) => config.gradient_library = v.clone(),
                (name, _) => {
                    return Err(DriverError::UnknownConfigField(vec![format!(
                        "`{}` has an unexpected value type",
                        name
                    )]))
                }
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationTechnique {
    Barrier,
    GradientDescent,
}

/// Nelder-Mead minimization of an arbitrary scalar `score` (§4.5 "barrier
/// method"). `score` is expected to already fold the barrier penalty into
/// its return value; this function has no notion of feasibility.
pub fn barrier_search(
    theta0: &DVector<f64>,
    config: &OptimizerConfig,
    mut score: impl FnMut(&DVector<f64>) -> f64,
) -> DVector<f64> {
    let dim = theta0.len();
    if dim == 0 {
        return theta0.clone();
    }
    const REFLECT: f64 = 1.0;
    const EXPAND: f64 = 2.0;
    const CONTRACT: f64 = 0.5;
    const SHRINK: f64 = 0.5;

    let mut simplex: Vec<DVector<f64>> = Vec::with_capacity(dim + 1);
    simplex.push(theta0.clone());
    for i in 0..dim {
        let mut point = theta0.clone();
        let h = if point[i] != 0.0 { 0.05 * point[i] } else { 0.00025 };
        point[i] += h;
        simplex.push(point);
    }
    let mut values: Vec<f64> = simplex.iter().map(|p| score(p)).collect();

    for _ in 0..config.num_iters {
        let mut order: Vec<usize> = (0..simplex.len()).collect();
        order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let best = values[0];
        let worst = values[dim];
        let second_worst = values[dim - 1];
        if (worst - best).abs() < 1e-12 {
            break;
        }

        let centroid = simplex[..dim]
            .iter()
            .fold(DVector::zeros(dim), |acc, p| acc + p)
            .scale(1.0 / dim as f64);

        let reflected = &centroid + (&centroid - &simplex[dim]).scale(REFLECT);
        let reflected_value = score(&reflected);

        if reflected_value < best {
            let expanded = &centroid + (&reflected - &centroid).scale(EXPAND);
            let expanded_value = score(&expanded);
            if expanded_value < reflected_value {
                simplex[dim] = expanded;
                values[dim] = expanded_value;
            } else {
                simplex[dim] = reflected;
                values[dim] = reflected_value;
            }
        } else if reflected_value < second_worst {
            simplex[dim] = reflected;
            values[dim] = reflected_value;
        } else {
            let contracted = &centroid + (&simplex[dim] - &centroid).scale(CONTRACT);
            let contracted_value = score(&contracted);
            if contracted_value < worst {
                simplex[dim] = contracted;
                values[dim] = contracted_value;
            } else {
                let best_point = simplex[0].clone();
                for i in 1..simplex.len() {
                    simplex[i] = &best_point + (&simplex[i] - &best_point).scale(SHRINK);
                    values[i] = score(&simplex[i]);
                }
            }
        }
    }

    let best_idx = values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, _)| i)
        .unwrap();
    simplex[best_idx].clone()
}

/// What one gradient-descent-with-dual-ascent iteration needs for the
/// current `theta` (§4.5): the primary loss and constraint upper bound, and
/// both of their gradients.
pub struct Evaluation {
    pub primary: f64,
    pub primary_grad: DVector<f64>,
    pub upper: f64,
    pub upper_grad: DVector<f64>,
}

/// Adam descent on `theta`, projected non-negative ascent on the single
/// dual variable `lambda` (§4.5 "Gradient descent with dual ascent"). Only
/// ever invoked by the driver for a single constraint tree.
pub fn gradient_descent_dual_ascent(
    theta0: &DVector<f64>,
    config: &OptimizerConfig,
    mut evaluate: impl FnMut(&DVector<f64>) -> Result<Evaluation, DriverError>,
) -> Result<Option<DVector<f64>>, DriverError> {
    let dim = theta0.len();
    let mut theta = theta0.clone();
    let mut lambda = config.lambda_init.max(0.0);
    let mut m = DVector::zeros(dim);
    let mut v = DVector::zeros(dim);
    const EPS: f64 = 1e-8;

    let mut best: Option<(DVector<f64>, f64)> = None;

    for t in 1..=config.num_iters {
        let eval = evaluate(&theta)?;

        if eval.upper <= 0.0 && best.as_ref().map_or(true, |(_, p)| eval.primary < *p) {
            best = Some((theta.clone(), eval.primary));
        }
        if config.verbose {
            log::debug!(
                "iter {}: primary={:.6} upper={:.6} lambda={:.6}",
                t,
                eval.primary,
                eval.upper,
                lambda
            );
        }

        let grad = eval.primary_grad + eval.upper_grad.scale(lambda);
        m = m.scale(config.beta_velocity) + grad.scale(1.0 - config.beta_velocity);
        v = v.scale(config.beta_rmsprop)
            + grad.component_mul(&grad).scale(1.0 - config.beta_rmsprop);
        let m_hat = m.scale(1.0 / (1.0 - config.beta_velocity.powi(t as i32)));
        let v_hat = v.scale(1.0 / (1.0 - config.beta_rmsprop.powi(t as i32)));
        let denom = v_hat.map(|x| x.sqrt() + EPS);
        let step = m_hat.component_div(&denom);
        theta -= step.scale(config.alpha_theta);

        lambda = (lambda + config.alpha_lamb * eval.upper).max(0.0);
    }

    Ok(best.map(|(theta, _)| theta))
}

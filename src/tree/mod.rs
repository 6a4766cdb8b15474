//! Parse tree (C2): owns the root [`TreeNode`], the confidence budget
//! `delta`, and the per-leaf cache that gives duplicate leaves a single
//! bound computation per propagation (§3, §4.2).

pub mod autodiff;
pub mod interval;
pub mod node;

use std::collections::HashMap;

use nalgebra::DVector;
use rand::Rng;

use crate::catalog::{Measure, Operator};
use crate::data::{Dataset, RegimeParams, Split};
use crate::error::{DriverError, ParseError};
use crate::model::Model;
use crate::parser::{self, ParsedExpr};
use crate::stats::{self, Branch, BoundMethod, LeafData, PairwiseLeafData};
use node::{BaseNode, ConstantNode, InternalNode, TreeNode};

#[derive(Debug, Clone)]
enum CachedLeafData {
    Supervised(LeafData),
    Pairwise(PairwiseLeafData),
}

impl CachedLeafData {
    fn is_empty(&self) -> bool {
        match self {
            CachedLeafData::Supervised(d) => d.is_empty(),
            CachedLeafData::Pairwise(d) => d.is_empty(),
        }
    }
}

/// A single base-leaf cache slot (§3 "`base_node_cache[name]`").
#[derive(Debug, Clone)]
struct CacheSlot {
    computed: bool,
    lower: f64,
    upper: f64,
    data: Option<CachedLeafData>,
}

impl CacheSlot {
    fn fresh() -> Self {
        CacheSlot {
            computed: false,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            data: None,
        }
    }
}

/// Arguments a single `propagate` call needs beyond the tree itself.
pub struct PropagateArgs<'a> {
    pub theta: &'a DVector<f64>,
    pub dataset: &'a Dataset,
    pub split: Split,
    pub model: &'a Model,
    pub bound_method: BoundMethod,
    pub branch: Branch,
    pub n_safety: usize,
    pub regime_params: RegimeParams,
}

/// Owns a constraint's compiled tree, its confidence budget, and the leaf
/// cache that survives across repeated `propagate` calls until `reset`.
pub struct ParseTree {
    pub root: TreeNode,
    pub delta: f64,
    pub n_nodes: usize,
    pub n_base_nodes: usize,
    cache: HashMap<String, CacheSlot>,
}

impl ParseTree {
    /// Compiles `expr` into a tree over the confidence budget `delta`,
    /// validating conditional columns against `known_columns` (§4.1/§4.2).
    pub fn build(expr: &str, delta: f64, known_columns: &[String]) -> Result<ParseTree, ParseError> {
        let parsed = parser::parse_constraint(expr, known_columns)?;
        let mut next_index = 0usize;
        let mut cache = HashMap::new();
        let mut n_base_nodes = 0usize;
        let root = build_node(&parsed, &mut next_index, &mut cache, &mut n_base_nodes);
        let mut tree = ParseTree {
            root,
            delta,
            n_nodes: next_index,
            n_base_nodes,
            cache,
        };
        tree.assign_deltas("equal")?;
        tree.assign_bounds_needed();
        Ok(tree)
    }

    /// Apportions `delta` to base leaves. Only `"equal"` is specified
    /// (§4.2): every base-node *instance* (duplicates counted separately)
    /// receives `delta / n_base_nodes`, so the sum across leaves is exactly
    /// `delta` regardless of duplication.
    pub fn assign_deltas(&mut self, method: &str) -> Result<(), DriverError> {
        if method != "equal" {
            return Err(DriverError::UnsupportedDeltaWeighting(method.to_string()));
        }
        if self.n_base_nodes == 0 {
            return Ok(());
        }
        let share = self.delta / self.n_base_nodes as f64;
        assign_delta_recursive(&mut self.root, share);
        Ok(())
    }

    /// Second pass (§4.2): narrows which side(s) of each node's interval
    /// propagation actually needs, starting from the root needing only
    /// `upper` (the constraint is satisfied iff `root.upper <= 0`).
    pub fn assign_bounds_needed(&mut self) {
        propagate_needs(&mut self.root, false, true);
    }

    /// Clears the per-leaf `{computed, lower, upper}` triple and, if
    /// `reset_data` is set, the cached leaf data too (§4.2).
    pub fn reset(&mut self, reset_data: bool) {
        for slot in self.cache.values_mut() {
            slot.computed = false;
            slot.lower = f64::NEG_INFINITY;
            slot.upper = f64::INFINITY;
            if reset_data {
                slot.data = None;
            }
        }
    }

    /// Post-order walk (§4.2 "Propagation algorithm"): sets `root.lower`/`root.upper`.
    pub fn propagate(&mut self, args: &PropagateArgs, rng: &mut impl Rng) -> Result<(), DriverError> {
        propagate_node(&mut self.root, &mut self.cache, args, rng)
    }

    pub fn root_upper(&self) -> f64 {
        self.root.interval().upper
    }

    pub fn root_lower(&self) -> f64 {
        self.root.interval().lower
    }

    /// Gradient of `root.upper` w.r.t. `theta` after a completed `propagate`
    /// call, or `None` if some leaf it depends on does not support one
    /// (§9 design note (a)). Used only by the gradient-descent optimization
    /// technique; the barrier-method technique never calls this.
    pub fn gradient_upper(&self, args: &PropagateArgs) -> Option<DVector<f64>> {
        autodiff::root_upper_gradient(&self.root, &self.cache, args.model, args)
    }
}

fn build_node(
    parsed: &ParsedExpr,
    next_index: &mut usize,
    cache: &mut HashMap<String, CacheSlot>,
    n_base_nodes: &mut usize,
) -> TreeNode {
    match parsed {
        ParsedExpr::Constant(value) => {
            let index = *next_index;
            *next_index += 1;
            TreeNode::Constant(ConstantNode {
                index,
                value: *value,
            })
        }
        ParsedExpr::Base(measure, cols) => {
            let index = *next_index;
            *next_index += 1;
            *n_base_nodes += 1;
            let node = BaseNode {
                index,
                measure: *measure,
                conditional_columns: cols.clone(),
                delta: 0.0,
                lower: f64::NEG_INFINITY,
                upper: f64::INFINITY,
                will_lower_bound: true,
                will_upper_bound: true,
            };
            cache
                .entry(node.canonical_name())
                .or_insert_with(CacheSlot::fresh);
            TreeNode::Base(node)
        }
        ParsedExpr::Internal(op, left, right) => {
            let left_node = build_node(left, next_index, cache, n_base_nodes);
            let right_node = right
                .as_ref()
                .map(|r| build_node(r, next_index, cache, n_base_nodes));
            let index = *next_index;
            *next_index += 1;
            TreeNode::Internal(InternalNode {
                index,
                op: *op,
                left: Box::new(left_node),
                right: right_node.map(Box::new),
                lower: f64::NEG_INFINITY,
                upper: f64::INFINITY,
                will_lower_bound: true,
                will_upper_bound: true,
            })
        }
    }
}

fn assign_delta_recursive(node: &mut TreeNode, share: f64) {
    match node {
        TreeNode::Base(b) => b.delta = share,
        TreeNode::Internal(n) => {
            assign_delta_recursive(&mut n.left, share);
            if let Some(r) = &mut n.right {
                assign_delta_recursive(r, share);
            }
        }
        TreeNode::Constant(_) => {}
    }
}

/// Monotonicity table (§4.2): descends the "which side does this node need"
/// requirement from parent to children. `add`/`min`/`max`/`exp` pass the
/// same direction through (monotonic increasing in every argument); `sub`
/// flips the right child's direction; `mult`/`div`/`pow` are sign-dependent
/// and conservatively require both sides of both children; `abs` requires
/// both sides of its operand regardless of which side of itself is needed,
/// since either side of `abs` depends on comparing both child endpoints.
fn propagate_needs(node: &mut TreeNode, need_lower: bool, need_upper: bool) {
    node.set_bounds_needed(need_lower, need_upper);
    if let TreeNode::Internal(n) = node {
        match n.op {
            Operator::Add | Operator::Min | Operator::Max => {
                propagate_needs(&mut n.left, need_lower, need_upper);
                if let Some(r) = &mut n.right {
                    propagate_needs(r, need_lower, need_upper);
                }
            }
            Operator::Sub => {
                propagate_needs(&mut n.left, need_lower, need_upper);
                if let Some(r) = &mut n.right {
                    propagate_needs(r, need_upper, need_lower);
                }
            }
            Operator::Mult | Operator::Div | Operator::Pow => {
                propagate_needs(&mut n.left, true, true);
                if let Some(r) = &mut n.right {
                    propagate_needs(r, true, true);
                }
            }
            Operator::Abs => {
                propagate_needs(&mut n.left, true, true);
            }
            Operator::Exp => {
                propagate_needs(&mut n.left, need_lower, need_upper);
            }
        }
    }
}

fn propagate_node(
    node: &mut TreeNode,
    cache: &mut HashMap<String, CacheSlot>,
    args: &PropagateArgs,
    rng: &mut impl Rng,
) -> Result<(), DriverError> {
    match node {
        TreeNode::Constant(_) => Ok(()),
        TreeNode::Base(b) => {
            let name = b.canonical_name();
            let slot = cache.entry(name).or_insert_with(CacheSlot::fresh);
            if !slot.computed {
                if slot.data.is_none() {
                    slot.data = Some(prepare_leaf(b, args, rng));
                }
                let iv = compute_leaf_bound(b, slot.data.as_ref().unwrap(), args, rng)?;
                slot.lower = iv.lower;
                slot.upper = iv.upper;
                slot.computed = true;
            }
            b.lower = slot.lower;
            b.upper = slot.upper;
            Ok(())
        }
        TreeNode::Internal(n) => {
            propagate_node(&mut n.left, cache, args, rng)?;
            if let Some(r) = &mut n.right {
                propagate_node(r, cache, args, rng)?;
            }
            let a = n.left.interval();
            let b = n.right.as_ref().map(|r| r.interval());
            let combined = match n.op {
                Operator::Add => interval::add(a, b.unwrap()),
                Operator::Sub => interval::sub(a, b.unwrap()),
                Operator::Mult => interval::mult(a, b.unwrap()),
                Operator::Div => interval::div(a, b.unwrap()),
                Operator::Pow => interval::pow(a, b.unwrap())?,
                Operator::Min => interval::min(a, b.unwrap()),
                Operator::Max => interval::max(a, b.unwrap()),
                Operator::Abs => interval::abs(a),
                Operator::Exp => interval::exp(a),
            };
            n.lower = combined.lower;
            n.upper = combined.upper;
            Ok(())
        }
    }
}

fn compute_leaf_bound(
    b: &BaseNode,
    data: &CachedLeafData,
    args: &PropagateArgs,
    rng: &mut impl Rng,
) -> Result<interval::Interval, DriverError> {
    if data.is_empty() {
        log::warn!(
            "leaf `{}` has no masked rows; reporting (-inf, +inf)",
            b.canonical_name()
        );
        return Ok(interval::Interval::unbounded());
    }

    match args.bound_method {
        BoundMethod::Manual => Ok(stats::manual_bound(b.lower, b.upper)),
        BoundMethod::Random => Ok(stats::random_bound(rng)),
        BoundMethod::Ttest => {
            let z = zhat(b.measure, args.model, args.theta, &data);
            let iv = stats::ttest_bound(
                &z,
                b.delta,
                args.branch,
                b.will_lower_bound,
                b.will_upper_bound,
            )?;
            Ok(iv)
        }
    }
}

fn prepare_leaf(b: &BaseNode, args: &PropagateArgs, rng: &mut impl Rng) -> CachedLeafData {
    if b.measure.is_pairwise() {
        let (group_a, group_b) = (&b.conditional_columns[0], &b.conditional_columns[1]);
        let data = stats::prepare_pairwise_leaf(
            args.dataset,
            args.split,
            group_a,
            group_b,
            args.branch,
            args.n_safety,
            rng,
        );
        return CachedLeafData::Pairwise(data);
    }
    let data = match args.regime_params {
        RegimeParams::Supervised => stats::prepare_supervised_leaf(
            args.dataset,
            args.split,
            &b.conditional_columns,
            args.branch,
            args.n_safety,
        ),
        RegimeParams::ReinforcementLearning {
            gamma,
            min_return,
            max_return,
        } => stats::prepare_rl_leaf(
            args.dataset,
            args.split,
            gamma,
            min_return,
            max_return,
            args.branch,
            args.n_safety,
        ),
    };
    CachedLeafData::Supervised(data)
}

fn zhat(measure: Measure, model: &Model, theta: &DVector<f64>, data: &CachedLeafData) -> Vec<f64> {
    match data {
        CachedLeafData::Supervised(leaf) => (model.sample_from_statistic)(measure, theta, leaf),
        CachedLeafData::Pairwise(pairwise) => stats::pairwise_zhat(model, theta, pairwise),
    }
}

//! The tagged node variants that replace a class hierarchy (§9 "Dynamic
//! dispatch on nodes"): `Internal`, `Constant`, `Base`. Each carries its
//! post-order `index` and the `[lower, upper]` slot propagation fills in.

use crate::catalog::{Measure, Operator};
use crate::tree::interval::Interval;

/// An `add`/`sub`/.../`exp` node. `right` is `None` for the unary operators.
#[derive(Debug, Clone)]
pub struct InternalNode {
    pub index: usize,
    pub op: Operator,
    pub left: Box<TreeNode>,
    pub right: Option<Box<TreeNode>>,
    pub lower: f64,
    pub upper: f64,
    pub will_lower_bound: bool,
    pub will_upper_bound: bool,
}

/// A finite scalar literal; `lower == upper == value` always.
#[derive(Debug, Clone, Copy)]
pub struct ConstantNode {
    pub index: usize,
    pub value: f64,
}

/// A measurement leaf, optionally restricted to rows where every named
/// sensitive column equals 1.
#[derive(Debug, Clone)]
pub struct BaseNode {
    pub index: usize,
    pub measure: Measure,
    pub conditional_columns: Vec<String>,
    pub delta: f64,
    pub lower: f64,
    pub upper: f64,
    pub will_lower_bound: bool,
    pub will_upper_bound: bool,
}

impl BaseNode {
    /// Canonical cache key / pretty-print name: `"MEASURE"` or
    /// `"(MEASURE | [Col1, Col2])"` when conditioned.
    pub fn canonical_name(&self) -> String {
        if self.conditional_columns.is_empty() {
            self.measure.to_string()
        } else {
            format!(
                "({} | [{}])",
                self.measure,
                self.conditional_columns.join(", ")
            )
        }
    }
}

#[derive(Debug, Clone)]
pub enum TreeNode {
    Internal(InternalNode),
    Constant(ConstantNode),
    Base(BaseNode),
}

impl TreeNode {
    pub fn index(&self) -> usize {
        match self {
            TreeNode::Internal(n) => n.index,
            TreeNode::Constant(n) => n.index,
            TreeNode::Base(n) => n.index,
        }
    }

    pub fn interval(&self) -> Interval {
        match self {
            TreeNode::Internal(n) => Interval::new(n.lower, n.upper),
            TreeNode::Constant(n) => Interval::degenerate(n.value),
            TreeNode::Base(n) => Interval::new(n.lower, n.upper),
        }
    }

    pub fn set_interval(&mut self, iv: Interval) {
        match self {
            TreeNode::Internal(n) => {
                n.lower = iv.lower;
                n.upper = iv.upper;
            }
            TreeNode::Constant(_) => {}
            TreeNode::Base(n) => {
                n.lower = iv.lower;
                n.upper = iv.upper;
            }
        }
    }

    pub fn will_lower_bound(&self) -> bool {
        match self {
            TreeNode::Internal(n) => n.will_lower_bound,
            TreeNode::Constant(_) => true,
            TreeNode::Base(n) => n.will_lower_bound,
        }
    }

    pub fn will_upper_bound(&self) -> bool {
        match self {
            TreeNode::Internal(n) => n.will_upper_bound,
            TreeNode::Constant(_) => true,
            TreeNode::Base(n) => n.will_upper_bound,
        }
    }

    pub fn set_bounds_needed(&mut self, lower: bool, upper: bool) {
        match self {
            TreeNode::Internal(n) => {
                n.will_lower_bound = lower;
                n.will_upper_bound = upper;
            }
            TreeNode::Constant(_) => {}
            TreeNode::Base(n) => {
                n.will_lower_bound = lower;
                n.will_upper_bound = upper;
            }
        }
    }
}

impl std::fmt::Display for TreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeNode::Constant(n) => write!(f, "{}", n.value),
            TreeNode::Base(n) => write!(f, "{}", n.canonical_name()),
            TreeNode::Internal(n) => match (&n.op, &n.right) {
                (Operator::Abs, None) => write!(f, "abs({})", n.left),
                (Operator::Exp, None) => write!(f, "exp({})", n.left),
                (Operator::Min, Some(r)) => write!(f, "min({}, {})", n.left, r),
                (Operator::Max, Some(r)) => write!(f, "max({}, {})", n.left, r),
                (op, Some(r)) => {
                    let sym = match op {
                        Operator::Add => "+",
                        Operator::Sub => "-",
                        Operator::Mult => "*",
                        Operator::Div => "/",
                        Operator::Pow => "**",
                        _ => unreachable!("binary operator symbol"),
                    };
                    write!(f, "({} {} {})", n.left, sym, r)
                }
                (op, None) => write!(f, "{}({})", op, n.left),
            },
        }
    }
}

//! Process-wide constant tables: the catalog of measure function names and
//! the operator symbol -> opcode map. Both are read-only once built, per
//! the "Global/module state" design note.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Statistical measures a `Base` leaf may reference. Resolution of what a
/// given measure actually *computes* is delegated to the caller-supplied
/// `Model` capability set (§3 "Model"); this enum only names the catalog
/// entries the parser and the tree accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    /// Positive prediction rate.
    Pr,
    /// Negative prediction rate.
    Nr,
    /// False positive rate.
    Fpr,
    /// False negative rate.
    Fnr,
    /// True positive rate.
    Tpr,
    /// True negative rate.
    Tnr,
    /// Mean squared error.
    Mse,
    /// Mean signed error.
    MeanError,
    /// Importance-weighted return of a new RL policy.
    JPiNew,
    /// Built-in pairwise regression-error-gap leaf (`MEDCustomBaseNode` in
    /// the original). Its two conditional columns name the two groups being
    /// compared rather than an AND-mask, and its leaf data/zhat preparation
    /// bypass the generic measure dispatch (see `stats::med`).
    Med,
}

impl Measure {
    pub const ALL: &'static [Measure] = &[
        Measure::Pr,
        Measure::Nr,
        Measure::Fpr,
        Measure::Fnr,
        Measure::Tpr,
        Measure::Tnr,
        Measure::Mse,
        Measure::MeanError,
        Measure::JPiNew,
        Measure::Med,
    ];

    /// `true` for the built-in pair-difference leaf, which needs exactly two
    /// conditional columns naming the compared groups rather than an
    /// AND-masked restriction.
    pub fn is_pairwise(self) -> bool {
        matches!(self, Measure::Med)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Measure::Pr => "PR",
            Measure::Nr => "NR",
            Measure::Fpr => "FPR",
            Measure::Fnr => "FNR",
            Measure::Tpr => "TPR",
            Measure::Tnr => "TNR",
            Measure::Mse => "MSE",
            Measure::MeanError => "Mean_Error",
            Measure::JPiNew => "J_pi_new",
            Measure::Med => "MED",
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Measure {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Measure::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ParseError::UnknownMeasure(s.to_string()))
    }
}

/// Arithmetic operators the expression grammar accepts (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    Div,
    Pow,
    Min,
    Max,
    Abs,
    Exp,
}

impl Operator {
    /// `true` for unary operators (`abs`, `exp`), which have no `right` child.
    pub fn is_unary(self) -> bool {
        matches!(self, Operator::Abs | Operator::Exp)
    }

    /// Maps an infix token (`+`, `-`, `*`, `/`, `**`) to its opcode.
    /// `None` for anything outside the accepted symbol set (e.g. `%`, `^`).
    pub fn from_symbol(sym: &str) -> Option<Operator> {
        match sym {
            "+" => Some(Operator::Add),
            "-" => Some(Operator::Sub),
            "*" => Some(Operator::Mult),
            "/" => Some(Operator::Div),
            "**" => Some(Operator::Pow),
            _ => None,
        }
    }

    /// Maps a call-form name (`abs(x)`, `min(a, b)`, ...) to its opcode and
    /// expected arity. `None` for an unrecognized call name.
    pub fn from_call_name(name: &str) -> Option<(Operator, usize)> {
        match name {
            "abs" => Some((Operator::Abs, 1)),
            "exp" => Some((Operator::Exp, 1)),
            "min" => Some((Operator::Min, 2)),
            "max" => Some((Operator::Max, 2)),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Add => "add",
            Operator::Sub => "sub",
            Operator::Mult => "mult",
            Operator::Div => "div",
            Operator::Pow => "pow",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::Abs => "abs",
            Operator::Exp => "exp",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

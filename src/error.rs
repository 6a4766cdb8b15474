//! Typed error hierarchy for the constraint core.
//!
//! Each family maps to a "kind" from the error handling design: parse
//! errors abort tree construction, bound/domain errors abort a single
//! propagation, and driver errors abort a run. `NumericallyDegenerate`
//! is intentionally not an `Err` variant anywhere on the hot path: per
//! the recovery policy it is logged and treated as an unbounded side,
//! not propagated as a failure.

use thiserror::Error;

/// Errors raised while compiling a constraint string into a parse tree (C1).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),

    #[error("unknown measure function `{0}`")]
    UnknownMeasure(String),

    #[error("malformed conditional restriction: {0}")]
    BadConditional(String),

    #[error("`{name}` expects {expected} argument(s), found {found}")]
    BadArity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

/// Errors raised while propagating interval bounds through a tree (C3/C4).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BoundError {
    #[error("unsupported bound method `{0}`")]
    UnsupportedBoundMethod(String),

    #[error("interval domain error: {0}")]
    DomainError(String),
}

/// Errors raised by the selection driver (C5).
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Bound(#[from] BoundError),

    #[error("unsupported optimizer `{0}`")]
    UnsupportedOptimizer(String),

    #[error("unsupported regime `{0}`")]
    UnsupportedRegime(String),

    #[error("unsupported delta-weighting method `{0}`")]
    UnsupportedDeltaWeighting(String),

    #[error("gradient-descent optimization requested but the model/primary objective does not supply gradients")]
    GradientUnavailable,

    #[error("unknown field(s) in optimizer configuration: {0:?}")]
    UnknownConfigField(Vec<String>),
}

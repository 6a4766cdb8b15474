//! Core machinery of a Seldonian algorithm: a constraint DSL parser, an
//! interval bound propagator, and a constrained optimization driver that
//! searches for model parameters minimizing a primary loss subject to
//! behavioral constraints checked with high-confidence statistical bounds.
//!
//! The crate is a library only; loading datasets from disk, argument
//! parsing, and persisting results are the caller's job.

pub mod catalog;
pub mod data;
pub mod driver;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod parser;
pub mod stats;
pub mod tree;

pub use data::{Dataset, DatasetMetadata, Regime, RegimeParams, Split, SubRegime};
pub use driver::{seldonian_algorithm, DriverConfig, Solution};
pub use error::{BoundError, DriverError, ParseError};
pub use model::{Model, PrimaryObjective};
pub use optimizer::{ConfigValue, OptimizationTechnique, OptimizerConfig};
pub use tree::{ParseTree, PropagateArgs};

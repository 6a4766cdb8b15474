//! Statistics & bounds (C3): measure evaluators, unbiased per-sample
//! estimators, and the two-sided Student-t confidence bound (§4.3).

pub mod bounds;
pub mod data_prep;
pub mod med;

pub use bounds::{manual_bound, random_bound, stddev, ttest_bound, BoundMethod};
pub use data_prep::{prepare_rl_leaf, prepare_supervised_leaf, Branch, LeafData, LeafDataKind};
pub use med::{pairwise_zhat, prepare_pairwise_leaf, PairwiseLeafData};

//! Dataset metadata and in-memory storage (§3 "Dataset", §6 "Dataset
//! metadata"). File-format ingestion is explicitly out of scope; callers
//! hand over already-parsed rows and a [`DatasetMetadata`].

use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    SupervisedLearning,
    ReinforcementLearning,
}

impl Regime {
    pub fn from_str_checked(s: &str) -> Result<Self, DriverError> {
        match s {
            "supervised_learning" => Ok(Regime::SupervisedLearning),
            "reinforcement_learning" => Ok(Regime::ReinforcementLearning),
            other => Err(DriverError::UnsupportedRegime(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRegime {
    Classification,
    Regression,
}

/// Mirrors the recognized keys of the on-disk JSON metadata (§6); the file
/// format itself is not parsed here, only the struct it would deserialize into.
#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    pub regime: Regime,
    pub sub_regime: Option<SubRegime>,
    pub columns: Vec<String>,
    pub sensitive_columns: Vec<String>,
    pub label_column: Option<String>,
    pub include_sensitive_columns: bool,
    pub include_intercept_term: bool,
    /// Reinforcement-learning regime only: column carrying the episode id.
    pub episode_index_column: Option<String>,
    /// Reinforcement-learning regime only: column carrying the per-step reward.
    pub reward_column: Option<String>,
}

impl DatasetMetadata {
    pub fn label_column_index(&self) -> Option<usize> {
        self.label_column
            .as_ref()
            .and_then(|name| self.columns.iter().position(|c| c == name))
    }

    pub fn sensitive_column_indices(&self) -> Vec<usize> {
        self.sensitive_columns
            .iter()
            .filter_map(|name| self.columns.iter().position(|c| c == name))
            .collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// A table of rows, all numeric, in `metadata.columns` order; for the
/// reinforcement-learning regime an `episode_index` column and a reward
/// column are expected among `columns` (identified by name via metadata).
#[derive(Debug, Clone)]
pub struct Dataset {
    pub metadata: DatasetMetadata,
    pub rows: Vec<Vec<f64>>,
}

/// Regime-specific parameters a propagation needs beyond the dataset itself
/// (§4.3's reinforcement-learning leaf preparation: discount and return
/// normalization bounds).
#[derive(Debug, Clone, Copy)]
pub enum RegimeParams {
    Supervised,
    ReinforcementLearning {
        gamma: f64,
        min_return: f64,
        max_return: f64,
    },
}

/// A disjoint index-range split of a dataset (§3 "splits are disjoint index ranges").
#[derive(Debug, Clone, Copy)]
pub struct Split {
    pub start: usize,
    pub end: usize,
}

impl Split {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows_in(&self, split: Split) -> &[Vec<f64>] {
        &self.rows[split.start..split.end]
    }

    /// Copies out the rows of `split` as a standalone dataset, for primary
    /// objectives (§4.5 reinforcement-learning case) that take a whole
    /// `Dataset` rather than a feature/label pair.
    pub fn subset(&self, split: Split) -> Dataset {
        Dataset {
            metadata: self.metadata.clone(),
            rows: self.rows_in(split).to_vec(),
        }
    }

    /// Splits into a *candidate* prefix and a *safety* suffix, the safety
    /// split taking the last `frac_safety` fraction of rows (default 0.6).
    pub fn split_candidate_safety(&self, frac_safety: f64) -> (Split, Split) {
        let n = self.len();
        let n_safety = (n as f64 * frac_safety).round() as usize;
        let n_candidate = n - n_safety;
        (
            Split {
                start: 0,
                end: n_candidate,
            },
            Split {
                start: n_candidate,
                end: n,
            },
        )
    }
}

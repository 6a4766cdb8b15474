//! Leaf data preparation (§4.3): masks rows for a conditional measurement
//! and assembles the regime-specific feature/label or return data a
//! `Model` needs to compute `zhat`. Runs once per leaf per candidate
//! selection / safety test and is cached by the owning [`crate::tree::ParseTree`].

use std::collections::HashMap;

use crate::data::{Dataset, Split};

/// Which split a propagation is scoring against; drives the `datasize`
/// formula (§4.3) and which bound-inflation factor applies (§4.3/§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    CandidateSelection,
    SafetyTest,
}

#[derive(Debug, Clone)]
pub enum LeafDataKind {
    Supervised {
        features: Vec<Vec<f64>>,
        labels: Vec<f64>,
    },
    ReinforcementLearning {
        normalized_returns: Vec<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct LeafData {
    pub kind: LeafDataKind,
    pub datasize: usize,
}

impl LeafData {
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            LeafDataKind::Supervised { features, .. } => features.is_empty(),
            LeafDataKind::ReinforcementLearning { normalized_returns } => {
                normalized_returns.is_empty()
            }
        }
    }
}

/// Supervised-regime leaf preparation. `conditional_columns` are ANDed
/// together as 0/1 group indicators; every masked row must equal 1 on
/// each of them.
pub fn prepare_supervised_leaf(
    dataset: &Dataset,
    split: Split,
    conditional_columns: &[String],
    branch: Branch,
    n_safety: usize,
) -> LeafData {
    let meta = &dataset.metadata;
    let cond_indices: Vec<usize> = conditional_columns
        .iter()
        .filter_map(|name| meta.column_index(name))
        .collect();

    let rows = dataset.rows_in(split);
    let masked: Vec<&Vec<f64>> = rows
        .iter()
        .filter(|row| cond_indices.iter().all(|&idx| row[idx] == 1.0))
        .collect();

    let masked_fraction = if rows.is_empty() {
        0.0
    } else {
        masked.len() as f64 / rows.len() as f64
    };

    let datasize = match branch {
        Branch::SafetyTest => masked.len(),
        Branch::CandidateSelection => (n_safety as f64 * masked_fraction).round() as usize,
    };

    let label_index = meta.label_column_index().unwrap_or(meta.columns.len() - 1);
    let sensitive_indices = meta.sensitive_column_indices();

    let mut features = Vec::with_capacity(masked.len());
    let mut labels = Vec::with_capacity(masked.len());
    for row in &masked {
        labels.push(row[label_index]);
        let mut feature_row = Vec::new();
        if meta.include_intercept_term {
            feature_row.push(1.0);
        }
        for (idx, value) in row.iter().enumerate() {
            if idx == label_index {
                continue;
            }
            if !meta.include_sensitive_columns && sensitive_indices.contains(&idx) {
                continue;
            }
            feature_row.push(*value);
        }
        features.push(feature_row);
    }

    LeafData {
        kind: LeafDataKind::Supervised { features, labels },
        datasize,
    }
}

/// Reinforcement-learning leaf preparation. Rows are grouped by the
/// episode-index column; each episode's discounted return is normalized
/// to `[0, 1]` via `(G - min_return) / (max_return - min_return)`.
pub fn prepare_rl_leaf(
    dataset: &Dataset,
    split: Split,
    gamma: f64,
    min_return: f64,
    max_return: f64,
    branch: Branch,
    n_safety: usize,
) -> LeafData {
    let meta = &dataset.metadata;
    let episode_col = meta
        .episode_index_column
        .as_deref()
        .and_then(|name| meta.column_index(name))
        .unwrap_or(0);
    let reward_col = meta
        .reward_column
        .as_deref()
        .and_then(|name| meta.column_index(name))
        .unwrap_or(meta.columns.len() - 1);

    let rows = dataset.rows_in(split);
    let mut episodes: HashMap<i64, Vec<f64>> = HashMap::new();
    for row in rows {
        let episode_id = row[episode_col] as i64;
        episodes.entry(episode_id).or_default().push(row[reward_col]);
    }

    let mut episode_ids: Vec<i64> = episodes.keys().copied().collect();
    episode_ids.sort_unstable();

    let span = max_return - min_return;
    let normalized_returns: Vec<f64> = episode_ids
        .iter()
        .map(|id| {
            let rewards = &episodes[id];
            let discounted: f64 = rewards
                .iter()
                .enumerate()
                .map(|(t, r)| gamma.powi(t as i32) * r)
                .sum();
            if span == 0.0 {
                0.0
            } else {
                (discounted - min_return) / span
            }
        })
        .collect();

    let datasize = match branch {
        Branch::CandidateSelection => n_safety,
        Branch::SafetyTest => normalized_returns.len(),
    };

    LeafData {
        kind: LeafDataKind::ReinforcementLearning { normalized_returns },
        datasize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DatasetMetadata, Regime};

    fn supervised_metadata() -> DatasetMetadata {
        DatasetMetadata {
            regime: Regime::SupervisedLearning,
            sub_regime: None,
            columns: vec!["M".to_string(), "X".to_string(), "Y".to_string()],
            sensitive_columns: vec!["M".to_string()],
            label_column: Some("Y".to_string()),
            include_sensitive_columns: false,
            include_intercept_term: true,
            episode_index_column: None,
            reward_column: None,
        }
    }

    #[test]
    fn masks_rows_and_builds_intercept_feature() {
        let dataset = Dataset {
            metadata: supervised_metadata(),
            rows: vec![
                vec![1.0, 2.0, 1.0],
                vec![0.0, 5.0, 0.0],
                vec![1.0, 3.0, 1.0],
            ],
        };
        let split = Split { start: 0, end: 3 };
        let leaf = prepare_supervised_leaf(
            &dataset,
            split,
            &["M".to_string()],
            Branch::SafetyTest,
            0,
        );
        match leaf.kind {
            LeafDataKind::Supervised { features, labels } => {
                assert_eq!(labels, vec![1.0, 1.0]);
                assert_eq!(features, vec![vec![1.0, 2.0], vec![1.0, 3.0]]);
            }
            _ => panic!("expected supervised leaf"),
        }
        assert_eq!(leaf.datasize, 2);
    }

    #[test]
    fn candidate_branch_datasize_scales_by_masked_fraction() {
        let dataset = Dataset {
            metadata: supervised_metadata(),
            rows: vec![
                vec![1.0, 2.0, 1.0],
                vec![0.0, 5.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 1.0, 0.0],
            ],
        };
        let split = Split { start: 0, end: 4 };
        let leaf = prepare_supervised_leaf(
            &dataset,
            split,
            &["M".to_string()],
            Branch::CandidateSelection,
            100,
        );
        assert_eq!(leaf.datasize, 25);
    }

    #[test]
    fn rl_leaf_normalizes_episode_returns() {
        let mut meta = supervised_metadata();
        meta.regime = Regime::ReinforcementLearning;
        meta.columns = vec!["episode_index".to_string(), "R".to_string()];
        meta.episode_index_column = Some("episode_index".to_string());
        meta.reward_column = Some("R".to_string());
        let dataset = Dataset {
            metadata: meta,
            rows: vec![
                vec![0.0, 1.0],
                vec![0.0, 1.0],
                vec![1.0, 0.0],
                vec![1.0, 0.0],
            ],
        };
        let split = Split { start: 0, end: 4 };
        let leaf = prepare_rl_leaf(&dataset, split, 1.0, 0.0, 2.0, Branch::SafetyTest, 0);
        match leaf.kind {
            LeafDataKind::ReinforcementLearning { normalized_returns } => {
                assert_eq!(normalized_returns, vec![1.0, 0.0]);
            }
            _ => panic!("expected RL leaf"),
        }
        assert_eq!(leaf.datasize, 2);
    }
}

//! The built-in pair-difference leaf (`MEDCustomBaseNode` in
//! `seldonian/nodes.py`): samples both named groups with replacement down
//! to the smaller group's size and returns the pointwise regression-error
//! gap `(yhat_a - y_a) - (yhat_b - y_b)`. Unlike the generic measures, this
//! leaf's data preparation and `zhat` bypass `Model::sample_from_statistic`
//! entirely and call `Model::predict` directly, exactly as the original does.

use nalgebra::DVector;
use rand::Rng;

use crate::data::{Dataset, Split};
use crate::model::Model;
use crate::stats::data_prep::Branch;

#[derive(Debug, Clone)]
pub struct PairwiseLeafData {
    pub features_a: Vec<Vec<f64>>,
    pub labels_a: Vec<f64>,
    pub features_b: Vec<Vec<f64>>,
    pub labels_b: Vec<f64>,
    pub datasize: usize,
}

impl PairwiseLeafData {
    pub fn is_empty(&self) -> bool {
        self.datasize == 0
    }
}

fn rows_for_group(
    dataset: &Dataset,
    split: Split,
    group_col_index: usize,
    label_index: usize,
    sensitive_indices: &[usize],
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut features = Vec::new();
    let mut labels = Vec::new();
    for row in dataset.rows_in(split) {
        if row[group_col_index] != 1.0 {
            continue;
        }
        labels.push(row[label_index]);
        // Unconditional, matching `MEDCustomBaseNode.calculate_data_forbound`:
        // unlike the generic leaf path, this one never gates the intercept
        // column on `include_intercept_term`.
        let mut feature_row = vec![1.0];
        for (idx, value) in row.iter().enumerate() {
            if idx == label_index {
                continue;
            }
            if sensitive_indices.contains(&idx) {
                continue;
            }
            feature_row.push(*value);
        }
        features.push(feature_row);
    }
    (features, labels)
}

fn resample_to(
    features: &[Vec<f64>],
    labels: &[f64],
    n: usize,
    rng: &mut impl Rng,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    if features.is_empty() || n == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut out_features = Vec::with_capacity(n);
    let mut out_labels = Vec::with_capacity(n);
    for _ in 0..n {
        let i = rng.gen_range(0..features.len());
        out_features.push(features[i].clone());
        out_labels.push(labels[i]);
    }
    (out_features, out_labels)
}

/// Builds the paired group data, resampling both groups with replacement to
/// `min(n_a, n_b)` rows (the source's `precalculate_data`). `group_a_col`
/// and `group_b_col` are the two conditional columns of a `(MED | [A, B])` leaf.
pub fn prepare_pairwise_leaf(
    dataset: &Dataset,
    split: Split,
    group_a_col: &str,
    group_b_col: &str,
    branch: Branch,
    n_safety: usize,
    rng: &mut impl Rng,
) -> PairwiseLeafData {
    let meta = &dataset.metadata;
    let label_index = meta.label_column_index().unwrap_or(meta.columns.len() - 1);
    let sensitive_indices = meta.sensitive_column_indices();
    let a_idx = meta.column_index(group_a_col);
    let b_idx = meta.column_index(group_b_col);

    let (features_a_all, labels_a_all) = match a_idx {
        Some(idx) => rows_for_group(dataset, split, idx, label_index, &sensitive_indices),
        None => (Vec::new(), Vec::new()),
    };
    let (features_b_all, labels_b_all) = match b_idx {
        Some(idx) => rows_for_group(dataset, split, idx, label_index, &sensitive_indices),
        None => (Vec::new(), Vec::new()),
    };

    let n_least = features_a_all.len().min(features_b_all.len());
    let (features_a, labels_a) = resample_to(&features_a_all, &labels_a_all, n_least, rng);
    let (features_b, labels_b) = resample_to(&features_b_all, &labels_b_all, n_least, rng);

    let total = dataset.rows_in(split).len();
    let datasize = match branch {
        Branch::SafetyTest => n_least,
        Branch::CandidateSelection => {
            let frac = if total == 0 {
                0.0
            } else {
                n_least as f64 / total as f64
            };
            (frac * n_safety as f64).round() as usize
        }
    };

    PairwiseLeafData {
        features_a,
        labels_a,
        features_b,
        labels_b,
        datasize,
    }
}

/// `(yhat_a - y_a) - (yhat_b - y_b)`, computed directly through `Model::predict`.
pub fn pairwise_zhat(model: &Model, theta: &DVector<f64>, data: &PairwiseLeafData) -> Vec<f64> {
    let pred_a = (model.predict)(theta, &data.features_a);
    let pred_b = (model.predict)(theta, &data.features_b);
    pred_a
        .iter()
        .zip(data.labels_a.iter())
        .zip(pred_b.iter().zip(data.labels_b.iter()))
        .map(|((ya_hat, ya), (yb_hat, yb))| (ya_hat - ya) - (yb_hat - yb))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DatasetMetadata, Regime};
    use rand::SeedableRng;

    fn metadata() -> DatasetMetadata {
        DatasetMetadata {
            regime: Regime::SupervisedLearning,
            sub_regime: None,
            columns: vec!["M".to_string(), "F".to_string(), "X".to_string(), "Y".to_string()],
            sensitive_columns: vec!["M".to_string(), "F".to_string()],
            label_column: Some("Y".to_string()),
            include_sensitive_columns: false,
            include_intercept_term: false,
            episode_index_column: None,
            reward_column: None,
        }
    }

    #[test]
    fn resamples_both_groups_to_the_smaller_size() {
        let dataset = Dataset {
            metadata: metadata(),
            rows: vec![
                vec![1.0, 0.0, 2.0, 1.0],
                vec![1.0, 0.0, 3.0, 1.0],
                vec![1.0, 0.0, 4.0, 1.0],
                vec![0.0, 1.0, 5.0, 0.0],
            ],
        };
        let split = Split { start: 0, end: 4 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let leaf = prepare_pairwise_leaf(&dataset, split, "M", "F", Branch::SafetyTest, 0, &mut rng);
        assert_eq!(leaf.features_a.len(), 1);
        assert_eq!(leaf.features_b.len(), 1);
        assert_eq!(leaf.datasize, 1);
    }

    #[test]
    fn intercept_column_is_unconditional_regardless_of_the_flag() {
        // metadata() sets include_intercept_term: false; the MED leaf still
        // prepends the intercept, unlike the generic supervised leaf path.
        let dataset = Dataset {
            metadata: metadata(),
            rows: vec![
                vec![1.0, 0.0, 2.0, 1.0],
                vec![0.0, 1.0, 5.0, 0.0],
            ],
        };
        let split = Split { start: 0, end: 2 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let leaf = prepare_pairwise_leaf(&dataset, split, "M", "F", Branch::SafetyTest, 0, &mut rng);
        assert_eq!(leaf.features_a[0], vec![1.0, 2.0]);
        assert_eq!(leaf.features_b[0], vec![1.0, 5.0]);
    }

    #[test]
    fn zhat_computes_pointwise_gap() {
        let data = PairwiseLeafData {
            features_a: vec![vec![1.0]],
            labels_a: vec![1.0],
            features_b: vec![vec![1.0]],
            labels_b: vec![0.0],
            datasize: 1,
        };
        let model = Model {
            predict: Box::new(|_theta, x| x.iter().map(|r| r[0]).collect()),
            fit: Box::new(|_x, _y| DVector::from_vec(vec![0.0])),
            evaluate_statistic: Box::new(|_m, _t, _d| 0.0),
            sample_from_statistic: Box::new(|_m, _t, _d| Vec::new()),
            gradient_sample: None,
        };
        let theta = DVector::from_vec(vec![0.0]);
        let z = pairwise_zhat(&model, &theta, &data);
        assert_eq!(z, vec![(1.0 - 1.0) - (1.0 - 0.0)]);
    }
}

//! TreeSHAP attributions for the native tree ensemble
//!
//! Path-dependent TreeSHAP: exact Shapley values of the ensemble's raw
//! margin, using node sample counts as the background distribution.

use crate::error::{PipelineError, PipelineResult};
use crate::models::ensemble::{Tree, TreeEnsemble, TreeNode};
use std::cmp::Ordering;
use std::sync::Arc;

/// Per-feature attributions for a single row
pub trait Explainer: Send + Sync {
    /// Signed contribution of every feature, in model feature order
    fn attributions(&self, features: &[f64]) -> PipelineResult<Vec<f64>>;

    /// Feature names, in the order attributions are returned
    fn feature_names(&self) -> &[String];
}

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

/// Exact TreeSHAP explainer over a `TreeEnsemble`
pub struct TreeShapExplainer {
    model: Arc<TreeEnsemble>,
}

impl TreeShapExplainer {
    pub fn new(model: Arc<TreeEnsemble>) -> Self {
        Self { model }
    }

    /// Expected raw margin; base value + Σ attributions = raw margin
    pub fn base_value(&self) -> f64 {
        self.model.expected_value()
    }

    /// SHAP values in log-odds space
    pub fn shap_values(&self, features: &[f64]) -> Vec<f64> {
        let mut phi = vec![0.0; self.model.feature_count()];
        for tree in &self.model.trees {
            self.tree_shap(tree, 0, features, &mut phi, Vec::new(), 1.0, 1.0, None);
        }
        phi
    }

    #[allow(clippy::too_many_arguments)]
    fn tree_shap(
        &self,
        tree: &Tree,
        node_index: usize,
        features: &[f64],
        phi: &mut [f64],
        mut path: Vec<PathElement>,
        zero_fraction: f64,
        one_fraction: f64,
        feature: Option<usize>,
    ) {
        extend_path(&mut path, zero_fraction, one_fraction, feature);

        match &tree.nodes[node_index] {
            TreeNode::Leaf { value, .. } => {
                for i in 1..path.len() {
                    let weight = unwound_path_sum(&path, i);
                    let element = path[i];
                    if let Some(f) = element.feature {
                        phi[f] += weight * (element.one_fraction - element.zero_fraction) * value;
                    }
                }
            }
            TreeNode::Split {
                feature: split,
                rule,
                left,
                right,
                count,
            } => {
                let value = features.get(*split).copied().unwrap_or(f64::NAN);
                let (hot, cold) = if rule.goes_left(value) {
                    (*left, *right)
                } else {
                    (*right, *left)
                };

                let cover = (*count).max(1) as f64;
                let hot_zero = tree.nodes[hot].count() as f64 / cover;
                let cold_zero = tree.nodes[cold].count() as f64 / cover;

                let mut incoming_zero = 1.0;
                let mut incoming_one = 1.0;
                if let Some(k) = (1..path.len()).find(|&k| path[k].feature == Some(*split)) {
                    incoming_zero = path[k].zero_fraction;
                    incoming_one = path[k].one_fraction;
                    unwind_path(&mut path, k);
                }

                self.tree_shap(
                    tree,
                    hot,
                    features,
                    phi,
                    path.clone(),
                    hot_zero * incoming_zero,
                    incoming_one,
                    Some(*split),
                );
                self.tree_shap(
                    tree,
                    cold,
                    features,
                    phi,
                    path,
                    cold_zero * incoming_zero,
                    0.0,
                    Some(*split),
                );
            }
        }
    }
}

impl Explainer for TreeShapExplainer {
    fn attributions(&self, features: &[f64]) -> PipelineResult<Vec<f64>> {
        if features.len() != self.model.feature_count() {
            return Err(PipelineError::SchemaMismatch(format!(
                "explainer expects {} features, got {}",
                self.model.feature_count(),
                features.len()
            )));
        }
        Ok(self.shap_values(features))
    }

    fn feature_names(&self) -> &[String] {
        &self.model.feature_names
    }
}

fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    for i in (0..depth).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i + 1) as f64 / (depth + 1) as f64;
        path[i].weight = zero_fraction * path[i].weight * (depth - i) as f64 / (depth + 1) as f64;
    }
}

fn unwind_path(path: &mut Vec<PathElement>, path_index: usize) {
    let depth = path.len() - 1;
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let mut next_one_portion = path[depth].weight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].weight;
            path[i].weight = next_one_portion * (depth + 1) as f64 / ((i + 1) as f64 * one_fraction);
            next_one_portion =
                tmp - path[i].weight * zero_fraction * (depth - i) as f64 / (depth + 1) as f64;
        } else {
            path[i].weight = path[i].weight * (depth + 1) as f64 / (zero_fraction * (depth - i) as f64);
        }
    }

    // Weights stay in place; only the feature metadata shifts down
    for i in path_index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_path_sum(path: &[PathElement], path_index: usize) -> f64 {
    let depth = path.len() - 1;
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let mut next_one_portion = path[depth].weight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next_one_portion * (depth + 1) as f64 / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion =
                path[i].weight - tmp * zero_fraction * (depth - i) as f64 / (depth + 1) as f64;
        } else if zero_fraction != 0.0 {
            total += (path[i].weight / zero_fraction) / ((depth - i) as f64 / (depth + 1) as f64);
        }
    }
    total
}

/// Indices of the `k` largest attributions by magnitude.
///
/// Equal magnitudes keep feature column order.
pub fn top_attributions(attributions: &[f64], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..attributions.len()).collect();
    indices.sort_by(|&a, &b| {
        attributions[b]
            .abs()
            .partial_cmp(&attributions[a].abs())
            .unwrap_or(Ordering::Equal)
    });
    indices.truncate(k);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ensemble::tests::sample_ensemble;

    #[test]
    fn test_exact_shapley_values() {
        let explainer = TreeShapExplainer::new(Arc::new(sample_ensemble()));
        let phi = explainer.shap_values(&[25.0, 1.0]);

        assert!((phi[0] - 0.73).abs() < 1e-9, "phi0 = {}", phi[0]);
        assert!((phi[1] + 0.11).abs() < 1e-9, "phi1 = {}", phi[1]);
    }

    #[test]
    fn test_local_accuracy() {
        let model = Arc::new(sample_ensemble());
        let explainer = TreeShapExplainer::new(model.clone());

        for row in [[25.0, 1.0], [45.0, 0.0], [45.0, 1.0], [f64::NAN, 0.0]] {
            let phi = explainer.shap_values(&row);
            let reconstructed = explainer.base_value() + phi.iter().sum::<f64>();
            assert!((reconstructed - model.predict_raw(&row)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_attribution_length_checked() {
        let explainer = TreeShapExplainer::new(Arc::new(sample_ensemble()));
        assert!(matches!(
            explainer.attributions(&[1.0]),
            Err(PipelineError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_top_attributions_ranks_by_magnitude() {
        let ranked = top_attributions(&[0.1, -0.9, 0.5, 0.0, 0.3, -0.2], 5);
        assert_eq!(ranked, vec![1, 2, 4, 5, 0]);
    }

    #[test]
    fn test_top_attributions_ties_keep_column_order() {
        let ranked = top_attributions(&[0.2, -0.4, 0.4, 0.2, -0.2, 0.4], 5);
        assert_eq!(ranked, vec![1, 2, 5, 0, 3]);
    }
}

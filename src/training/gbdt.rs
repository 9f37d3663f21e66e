//! Leaf-wise histogram gradient boosting for binary classification
//!
//! Features are bucketed once into at most `max_bin` bins (bin 0 holds
//! missing values). Each tree grows by repeatedly splitting the leaf with
//! the largest loss reduction until it has `num_leaves` leaves or no split
//! is admissible. Categorical features are split by sorting their levels
//! on gradient ratio and scanning prefixes.

use crate::models::ensemble::{sigmoid, SplitRule, Tree, TreeEnsemble, TreeNode};
use crate::preprocess::{FeatureKind, PreprocessSchema};
use crate::training::metrics::roc_auc;
use crate::training::TrainingError;
use std::cmp::Ordering;
use tracing::{debug, info};

const MIN_SUM_HESSIAN: f64 = 1e-3;
/// Smoothing added to hessians when ordering categories
const CAT_SMOOTH: f64 = 10.0;
/// Most categories that may go left in one split
const MAX_CAT_THRESHOLD: usize = 32;

/// Boosting hyper-parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GbdtParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub num_leaves: usize,
    pub min_data_in_leaf: usize,
    pub max_bin: usize,
    /// L2 regularisation on leaf values
    pub lambda_l2: f64,
    /// Weight of positive rows relative to negatives
    pub scale_pos_weight: f64,
    /// Log eval AUC every this many trees (0 disables)
    pub eval_period: usize,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            n_estimators: 500,
            learning_rate: 0.05,
            num_leaves: 31,
            min_data_in_leaf: 20,
            max_bin: 255,
            lambda_l2: 0.0,
            scale_pos_weight: 1.0,
            eval_period: 50,
        }
    }
}

/// Maps raw values of one feature to bins
#[derive(Debug, Clone)]
enum BinMapper {
    /// Bin `b >= 1` holds values `<= upper_bounds[b - 1]`
    Numeric { upper_bounds: Vec<f64> },
    /// Bin `code + 1` holds category `code`
    Categorical { levels: usize },
}

impl BinMapper {
    fn numeric(values: &[f64], max_bin: usize) -> Self {
        let mut distinct: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        distinct.sort_by(|a, b| a.total_cmp(b));
        distinct.dedup();

        let max_bins = max_bin.saturating_sub(1).max(1);
        let upper_bounds = if distinct.len() <= max_bins {
            distinct
        } else {
            // Quantile cut points over the distinct values
            let mut bounds: Vec<f64> = (1..=max_bins)
                .map(|i| distinct[(i * distinct.len() / max_bins).saturating_sub(1)])
                .collect();
            bounds.dedup();
            bounds
        };
        BinMapper::Numeric { upper_bounds }
    }

    fn bin_count(&self) -> usize {
        match self {
            BinMapper::Numeric { upper_bounds } => upper_bounds.len() + 1,
            BinMapper::Categorical { levels } => levels + 1,
        }
    }

    fn bin(&self, value: f64) -> u16 {
        if value.is_nan() {
            return 0;
        }
        match self {
            BinMapper::Numeric { upper_bounds } => {
                let position = upper_bounds.partition_point(|b| *b < value);
                (position.min(upper_bounds.len().saturating_sub(1)) + 1) as u16
            }
            BinMapper::Categorical { levels } => {
                if value < 0.0 || value.fract() != 0.0 || value as usize >= *levels {
                    0
                } else {
                    value as u16 + 1
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BinStats {
    grad: f64,
    hess: f64,
    count: usize,
}

impl BinStats {
    fn add(&mut self, other: &BinStats) {
        self.grad += other.grad;
        self.hess += other.hess;
        self.count += other.count;
    }

    fn sub(&self, other: &BinStats) -> BinStats {
        BinStats {
            grad: self.grad - other.grad,
            hess: self.hess - other.hess,
            count: self.count - other.count,
        }
    }
}

#[derive(Debug, Clone)]
struct SplitCandidate {
    gain: f64,
    feature: usize,
    rule: SplitRule,
    /// Bins that go left, indexed by bin
    left_bins: Vec<bool>,
}

/// Leaf under construction
struct GrowLeaf {
    node: usize,
    rows: Vec<usize>,
    total: BinStats,
    best: Option<SplitCandidate>,
}

/// Tree under construction; converted to a `Tree` at the end
enum GrowNode {
    Leaf {
        value: f64,
        count: usize,
    },
    Split {
        feature: usize,
        rule: SplitRule,
        left: usize,
        right: usize,
        count: usize,
    },
}

/// Gradient-boosted tree trainer
pub struct GbdtTrainer {
    params: GbdtParams,
}

impl GbdtTrainer {
    pub fn new(params: GbdtParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GbdtParams {
        &self.params
    }

    /// Fit an ensemble; `eval` rows only drive the periodic AUC log
    pub fn fit(
        &self,
        schema: &PreprocessSchema,
        features: &[Vec<f64>],
        labels: &[bool],
        eval: Option<(&[Vec<f64>], &[bool])>,
    ) -> Result<TreeEnsemble, TrainingError> {
        let n_rows = labels.len();
        if n_rows == 0 || features.len() != n_rows {
            return Err(TrainingError::EmptyDataset);
        }
        let positives = labels.iter().filter(|l| **l).count();
        if positives == 0 || positives == n_rows {
            return Err(TrainingError::SingleClass);
        }
        let n_features = schema.feature_count();

        let mappers: Vec<BinMapper> = (0..n_features)
            .map(|f| match schema.kind_of(&schema.feature_names[f]) {
                Some(FeatureKind::Categorical) => BinMapper::Categorical {
                    levels: schema
                        .categories
                        .get(&schema.feature_names[f])
                        .map(Vec::len)
                        .unwrap_or(0),
                },
                _ => {
                    let column: Vec<f64> = features.iter().map(|row| row[f]).collect();
                    BinMapper::numeric(&column, self.params.max_bin)
                }
            })
            .collect();

        // Column-major bins
        let bins: Vec<Vec<u16>> = (0..n_features)
            .map(|f| features.iter().map(|row| mappers[f].bin(row[f])).collect())
            .collect();

        let weights: Vec<f64> = labels
            .iter()
            .map(|&l| if l { self.params.scale_pos_weight } else { 1.0 })
            .collect();
        let weighted_pos: f64 = labels
            .iter()
            .zip(&weights)
            .filter(|(l, _)| **l)
            .map(|(_, w)| w)
            .sum();
        let weighted_neg: f64 = weights.iter().sum::<f64>() - weighted_pos;
        let init_score = (weighted_pos / weighted_neg).ln();

        let mut ensemble = TreeEnsemble::new(
            init_score,
            self.params.learning_rate,
            schema.feature_names.clone(),
            schema.fingerprint.clone(),
        );

        let mut scores = vec![init_score; n_rows];
        let mut eval_scores: Option<Vec<f64>> = eval.map(|(rows, _)| vec![init_score; rows.len()]);

        info!(
            rows = n_rows,
            positives = positives,
            features = n_features,
            init_score = init_score,
            "Boosting started"
        );

        for iteration in 0..self.params.n_estimators {
            let mut grad = vec![0.0; n_rows];
            let mut hess = vec![0.0; n_rows];
            for i in 0..n_rows {
                let p = sigmoid(scores[i]);
                let y = if labels[i] { 1.0 } else { 0.0 };
                grad[i] = weights[i] * (p - y);
                hess[i] = (weights[i] * p * (1.0 - p)).max(1e-16);
            }

            let (tree, leaf_rows) = self.grow_tree(&bins, &mappers, &grad, &hess);

            for (value, rows) in &leaf_rows {
                for &row in rows {
                    scores[row] += value;
                }
            }
            if let (Some(eval_scores), Some((eval_rows, _))) = (eval_scores.as_mut(), eval) {
                for (score, row) in eval_scores.iter_mut().zip(eval_rows) {
                    *score += tree.predict(row);
                }
            }

            let single_leaf = tree.nodes.len() == 1;
            ensemble.trees.push(tree);

            let done = iteration + 1;
            if self.params.eval_period > 0 && done % self.params.eval_period == 0 {
                if let (Some(eval_scores), Some((_, eval_labels))) = (eval_scores.as_ref(), eval) {
                    let probabilities: Vec<f64> = eval_scores.iter().map(|s| sigmoid(*s)).collect();
                    info!(
                        iteration = done,
                        eval_auc = roc_auc(eval_labels, &probabilities),
                        "Boosting progress"
                    );
                }
            }

            if single_leaf {
                debug!(iteration = done, "No admissible split left, stopping early");
                break;
            }
        }

        Ok(ensemble)
    }

    /// Grow one tree; also returns each leaf's value and training rows
    fn grow_tree(
        &self,
        bins: &[Vec<u16>],
        mappers: &[BinMapper],
        grad: &[f64],
        hess: &[f64],
    ) -> (Tree, Vec<(f64, Vec<usize>)>) {
        let all_rows: Vec<usize> = (0..grad.len()).collect();
        let total = sum_stats(&all_rows, grad, hess);

        let mut nodes = vec![GrowNode::Leaf {
            value: 0.0,
            count: all_rows.len(),
        }];
        let mut root = GrowLeaf {
            node: 0,
            rows: all_rows,
            total,
            best: None,
        };
        root.best = self.best_split(&root, bins, mappers, grad, hess);
        let mut leaves = vec![root];

        while leaves.len() < self.params.num_leaves.max(2) {
            let Some(chosen) = leaves
                .iter()
                .enumerate()
                .filter_map(|(i, leaf)| leaf.best.as_ref().map(|b| (i, b.gain)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
                .map(|(i, _)| i)
            else {
                break;
            };

            let leaf = leaves.swap_remove(chosen);
            let Some(split) = leaf.best else {
                break;
            };

            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = leaf
                .rows
                .iter()
                .partition(|&&row| split.left_bins[bins[split.feature][row] as usize]);

            let left_node = nodes.len();
            let right_node = left_node + 1;
            nodes.push(GrowNode::Leaf {
                value: 0.0,
                count: left_rows.len(),
            });
            nodes.push(GrowNode::Leaf {
                value: 0.0,
                count: right_rows.len(),
            });
            nodes[leaf.node] = GrowNode::Split {
                feature: split.feature,
                rule: split.rule,
                left: left_node,
                right: right_node,
                count: leaf.rows.len(),
            };

            for (node, rows) in [(left_node, left_rows), (right_node, right_rows)] {
                let total = sum_stats(&rows, grad, hess);
                let mut child = GrowLeaf {
                    node,
                    rows,
                    total,
                    best: None,
                };
                child.best = self.best_split(&child, bins, mappers, grad, hess);
                leaves.push(child);
            }
        }

        let mut leaf_rows = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let value = self.leaf_value(&leaf.total);
            nodes[leaf.node] = GrowNode::Leaf {
                value,
                count: leaf.rows.len(),
            };
            leaf_rows.push((value, leaf.rows));
        }

        (flatten(&nodes), leaf_rows)
    }

    fn leaf_value(&self, stats: &BinStats) -> f64 {
        -stats.grad / (stats.hess + self.params.lambda_l2) * self.params.learning_rate
    }

    fn score(&self, stats: &BinStats) -> f64 {
        stats.grad * stats.grad / (stats.hess + self.params.lambda_l2)
    }

    fn admissible(&self, left: &BinStats, right: &BinStats) -> bool {
        left.count >= self.params.min_data_in_leaf
            && right.count >= self.params.min_data_in_leaf
            && left.hess >= MIN_SUM_HESSIAN
            && right.hess >= MIN_SUM_HESSIAN
    }

    fn best_split(
        &self,
        leaf: &GrowLeaf,
        bins: &[Vec<u16>],
        mappers: &[BinMapper],
        grad: &[f64],
        hess: &[f64],
    ) -> Option<SplitCandidate> {
        if leaf.rows.len() < 2 * self.params.min_data_in_leaf {
            return None;
        }
        let parent_score = self.score(&leaf.total);
        let mut best: Option<SplitCandidate> = None;

        for (feature, mapper) in mappers.iter().enumerate() {
            let mut histogram = vec![BinStats::default(); mapper.bin_count()];
            for &row in &leaf.rows {
                let stats = &mut histogram[bins[feature][row] as usize];
                stats.grad += grad[row];
                stats.hess += hess[row];
                stats.count += 1;
            }

            let candidate = match mapper {
                BinMapper::Numeric { upper_bounds } => {
                    self.best_numeric(feature, upper_bounds, &histogram, &leaf.total, parent_score)
                }
                BinMapper::Categorical { .. } => {
                    self.best_categorical(feature, &histogram, &leaf.total, parent_score)
                }
            };

            if let Some(candidate) = candidate {
                if best.as_ref().map_or(true, |b| candidate.gain > b.gain) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn best_numeric(
        &self,
        feature: usize,
        upper_bounds: &[f64],
        histogram: &[BinStats],
        total: &BinStats,
        parent_score: f64,
    ) -> Option<SplitCandidate> {
        let missing = histogram[0];
        let mut best: Option<(f64, usize, bool)> = None;

        for default_left in [false, true] {
            let mut left = if default_left { missing } else { BinStats::default() };
            // Threshold after bin t: bins 1..=t go left
            for t in 1..histogram.len().saturating_sub(1) {
                left.add(&histogram[t]);
                let right = total.sub(&left);
                if !self.admissible(&left, &right) {
                    continue;
                }
                let gain = self.score(&left) + self.score(&right) - parent_score;
                if gain > 1e-12 && best.map_or(true, |(g, _, _)| gain > g) {
                    best = Some((gain, t, default_left));
                }
            }
            if missing.count == 0 {
                break;
            }
        }

        best.map(|(gain, t, default_left)| {
            let mut left_bins = vec![false; histogram.len()];
            left_bins[1..=t].iter_mut().for_each(|b| *b = true);
            left_bins[0] = default_left;
            SplitCandidate {
                gain,
                feature,
                rule: SplitRule::Numeric {
                    threshold: upper_bounds[t - 1],
                    default_left,
                },
                left_bins,
            }
        })
    }

    fn best_categorical(
        &self,
        feature: usize,
        histogram: &[BinStats],
        total: &BinStats,
        parent_score: f64,
    ) -> Option<SplitCandidate> {
        // Seen categories ordered by gradient ratio
        let mut order: Vec<usize> = (1..histogram.len())
            .filter(|&b| histogram[b].count > 0)
            .collect();
        if order.len() < 2 {
            return None;
        }
        order.sort_by(|&a, &b| {
            let ra = histogram[a].grad / (histogram[a].hess + CAT_SMOOTH);
            let rb = histogram[b].grad / (histogram[b].hess + CAT_SMOOTH);
            ra.partial_cmp(&rb).unwrap_or(Ordering::Equal)
        });

        let mut best: Option<(f64, Vec<usize>)> = None;
        let forward: Vec<usize> = order.clone();
        let backward: Vec<usize> = order.iter().rev().copied().collect();

        for direction in [forward, backward] {
            let mut left = BinStats::default();
            let limit = (direction.len() - 1).min(MAX_CAT_THRESHOLD);
            for k in 0..limit {
                left.add(&histogram[direction[k]]);
                let right = total.sub(&left);
                if !self.admissible(&left, &right) {
                    continue;
                }
                let gain = self.score(&left) + self.score(&right) - parent_score;
                if gain > 1e-12 && best.as_ref().map_or(true, |(g, _)| gain > *g) {
                    best = Some((gain, direction[..=k].to_vec()));
                }
            }
        }

        best.map(|(gain, left_set)| {
            let mut left_bins = vec![false; histogram.len()];
            let mut left_categories: Vec<u32> = left_set
                .iter()
                .map(|&b| {
                    left_bins[b] = true;
                    (b - 1) as u32
                })
                .collect();
            left_categories.sort_unstable();
            SplitCandidate {
                gain,
                feature,
                rule: SplitRule::Categorical { left_categories },
                left_bins,
            }
        })
    }
}

fn sum_stats(rows: &[usize], grad: &[f64], hess: &[f64]) -> BinStats {
    let mut stats = BinStats::default();
    for &row in rows {
        stats.grad += grad[row];
        stats.hess += hess[row];
        stats.count += 1;
    }
    stats
}

/// Pre-order renumbering so every child index is greater than its parent's
fn flatten(nodes: &[GrowNode]) -> Tree {
    fn visit(nodes: &[GrowNode], index: usize, out: &mut Vec<TreeNode>) -> usize {
        let position = out.len();
        match &nodes[index] {
            GrowNode::Leaf { value, count } => {
                out.push(TreeNode::Leaf {
                    value: *value,
                    count: *count as u64,
                });
            }
            GrowNode::Split {
                feature,
                rule,
                left,
                right,
                count,
            } => {
                out.push(TreeNode::Leaf { value: 0.0, count: 0 });
                let left_index = visit(nodes, *left, out);
                let right_index = visit(nodes, *right, out);
                out[position] = TreeNode::Split {
                    feature: *feature,
                    rule: rule.clone(),
                    left: left_index,
                    right: right_index,
                    count: *count as u64,
                };
            }
        }
        position
    }

    let mut out = Vec::with_capacity(nodes.len());
    visit(nodes, 0, &mut out);
    Tree { nodes: out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn schema() -> PreprocessSchema {
        let mut categories = BTreeMap::new();
        categories.insert(
            "Fault".to_string(),
            vec!["Policy Holder".to_string(), "Third Party".to_string()],
        );
        PreprocessSchema::new(
            "FraudFound_P",
            vec!["Age".to_string(), "Fault".to_string()],
            vec!["Age".to_string()],
        )
        .with_categories(categories)
    }

    /// Fraud when young and at fault, with some label noise
    fn synthetic(n: usize, seed: u64) -> (Vec<Vec<f64>>, Vec<bool>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut features = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let age: f64 = rng.gen_range(18.0..80.0);
            let fault = if rng.gen_bool(0.5) { 0.0 } else { 1.0 };
            let age = if rng.gen_bool(0.05) { f64::NAN } else { age };
            let risky = age < 35.0 && fault == 0.0;
            let label = if rng.gen_bool(0.02) { !risky } else { risky };
            features.push(vec![age, fault]);
            labels.push(label);
        }
        (features, labels)
    }

    fn params() -> GbdtParams {
        GbdtParams {
            n_estimators: 40,
            learning_rate: 0.1,
            num_leaves: 8,
            min_data_in_leaf: 10,
            max_bin: 63,
            eval_period: 0,
            ..GbdtParams::default()
        }
    }

    #[test]
    fn test_learns_simple_interaction() {
        let schema = schema();
        let (train_x, train_y) = synthetic(2000, 1);
        let (test_x, test_y) = synthetic(500, 2);

        let model = GbdtTrainer::new(params())
            .fit(&schema, &train_x, &train_y, Some((test_x.as_slice(), test_y.as_slice())))
            .unwrap();

        assert!(model.validate().is_ok());
        let probabilities: Vec<f64> = test_x.iter().map(|row| model.predict_proba(row)).collect();
        assert!(roc_auc(&test_y, &probabilities) > 0.85);

        assert!(model.predict_proba(&[25.0, 0.0]) > model.predict_proba(&[60.0, 1.0]));
    }

    #[test]
    fn test_training_is_deterministic() {
        let schema = schema();
        let (x, y) = synthetic(600, 3);
        let a = GbdtTrainer::new(params()).fit(&schema, &x, &y, None).unwrap();
        let b = GbdtTrainer::new(params()).fit(&schema, &x, &y, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trees_respect_leaf_limits() {
        let schema = schema();
        let (x, y) = synthetic(1000, 4);
        let model = GbdtTrainer::new(params()).fit(&schema, &x, &y, None).unwrap();

        for tree in &model.trees {
            assert!(tree.leaf_count() <= 8);
            for node in &tree.nodes {
                if let TreeNode::Leaf { count, .. } = node {
                    assert!(*count >= 10 || tree.nodes.len() == 1);
                }
            }
        }
    }

    #[test]
    fn test_scale_pos_weight_raises_init_score() {
        let schema = schema();
        let (x, y) = synthetic(500, 5);
        let plain = GbdtTrainer::new(GbdtParams {
            n_estimators: 1,
            ..params()
        })
        .fit(&schema, &x, &y, None)
        .unwrap();
        let weighted = GbdtTrainer::new(GbdtParams {
            n_estimators: 1,
            scale_pos_weight: 4.0,
            ..params()
        })
        .fit(&schema, &x, &y, None)
        .unwrap();
        assert!((weighted.init_score - plain.init_score - 4.0f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_single_class_rejected() {
        let schema = schema();
        let x = vec![vec![30.0, 0.0]; 50];
        let y = vec![false; 50];
        assert!(matches!(
            GbdtTrainer::new(params()).fit(&schema, &x, &y, None),
            Err(TrainingError::SingleClass)
        ));
    }

    #[test]
    fn test_numeric_binning() {
        let mapper = BinMapper::numeric(&[1.0, 2.0, 2.0, 3.0, f64::NAN], 255);
        assert_eq!(mapper.bin(f64::NAN), 0);
        assert_eq!(mapper.bin(1.0), 1);
        assert_eq!(mapper.bin(2.0), 2);
        assert_eq!(mapper.bin(2.5), 3);
        assert_eq!(mapper.bin(99.0), 3);
        assert_eq!(mapper.bin_count(), 4);

        let coarse = BinMapper::numeric(&(0..1000).map(f64::from).collect::<Vec<_>>(), 16);
        assert_eq!(coarse.bin_count(), 16);
    }

    #[test]
    fn test_flatten_orders_children_after_parents() {
        let nodes = vec![
            GrowNode::Split {
                feature: 0,
                rule: SplitRule::Numeric {
                    threshold: 1.0,
                    default_left: false,
                },
                left: 2,
                right: 1,
                count: 3,
            },
            GrowNode::Leaf { value: 0.5, count: 1 },
            GrowNode::Leaf { value: -0.5, count: 2 },
        ];
        let tree = flatten(&nodes);
        assert_eq!(tree.predict(&[0.0]), -0.5);
        assert_eq!(tree.predict(&[5.0]), 0.5);
        match &tree.nodes[0] {
            TreeNode::Split { left, right, .. } => assert!(*left > 0 && *right > *left),
            _ => panic!("root should split"),
        }
    }
}

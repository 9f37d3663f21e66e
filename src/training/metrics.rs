//! Evaluation metrics for the binary fraud classifier

use serde::Serialize;
use std::fmt;

/// Area under the ROC curve via the rank statistic; ties share their mean rank.
/// Returns 0.5 when either class is absent.
pub fn roc_auc(labels: &[bool], scores: &[f64]) -> f64 {
    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 || labels.len() != scores.len() {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        for &index in &order[i..=j] {
            if labels[index] {
                rank_sum_pos += mean_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = positives as f64;
    (rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * negatives as f64)
}

/// Precision, recall and F1 for one class
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassMetrics {
    fn from_counts(true_pos: usize, false_pos: usize, false_neg: usize) -> Self {
        let precision = ratio(true_pos, true_pos + false_pos);
        let recall = ratio(true_pos, true_pos + false_neg);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        Self {
            precision,
            recall,
            f1,
            support: true_pos + false_neg,
        }
    }
}

/// Per-class report at a fixed decision threshold; a probability equal to
/// the threshold counts as legitimate, as in `PredictionResult`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub threshold: f64,
    pub legitimate: ClassMetrics,
    pub fraud: ClassMetrics,
    pub accuracy: f64,
    pub roc_auc: f64,
}

impl ClassificationReport {
    pub fn evaluate(labels: &[bool], probabilities: &[f64], threshold: f64) -> Self {
        let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
        for (&label, &p) in labels.iter().zip(probabilities) {
            match (label, p > threshold) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (false, false) => tn += 1,
                (true, false) => fn_ += 1,
            }
        }

        Self {
            threshold,
            legitimate: ClassMetrics::from_counts(tn, fn_, fp),
            fraud: ClassMetrics::from_counts(tp, fp, fn_),
            accuracy: ratio(tp + tn, labels.len()),
            roc_auc: roc_auc(labels, probabilities),
        }
    }

    pub fn f1(&self) -> f64 {
        self.fraud.f1
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>14} {:>10} {:>10} {:>10} {:>10}", "", "precision", "recall", "f1-score", "support")?;
        for (name, m) in [("0", &self.legitimate), ("1", &self.fraud)] {
            writeln!(
                f,
                "{:>14} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        let support = self.legitimate.support + self.fraud.support;
        writeln!(f)?;
        writeln!(f, "{:>14} {:>10} {:>10} {:>10.2} {:>10}", "accuracy", "", "", self.accuracy, support)?;
        write!(f, "{:>14} {:>10.4}", "ROC-AUC", self.roc_auc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::prediction::PredictionResult;

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&labels, &[0.1, 0.2, 0.8, 0.9]), 1.0);
        assert_eq!(roc_auc(&labels, &[0.9, 0.8, 0.2, 0.1]), 0.0);
    }

    #[test]
    fn test_auc_ties_count_half() {
        let labels = [false, true];
        assert_eq!(roc_auc(&labels, &[0.5, 0.5]), 0.5);

        // One of two positives tied with the only negative
        let labels = [false, true, true];
        assert_eq!(roc_auc(&labels, &[0.4, 0.4, 0.9]), 0.75);
    }

    #[test]
    fn test_auc_single_class() {
        assert_eq!(roc_auc(&[true, true], &[0.1, 0.9]), 0.5);
    }

    #[test]
    fn test_classification_report() {
        let labels = [true, true, false, false, false];
        let probabilities = [0.9, 0.2, 0.6, 0.1, 0.3];
        let report = ClassificationReport::evaluate(&labels, &probabilities, 0.5);

        assert_eq!(report.fraud.support, 2);
        assert_eq!(report.legitimate.support, 3);
        assert!((report.fraud.precision - 0.5).abs() < 1e-12);
        assert!((report.fraud.recall - 0.5).abs() < 1e-12);
        assert!((report.f1() - 0.5).abs() < 1e-12);
        assert!((report.accuracy - 0.6).abs() < 1e-12);

        let rendered = report.to_string();
        assert!(rendered.contains("precision"));
        assert!(rendered.contains("ROC-AUC"));
    }

    #[test]
    fn test_no_predicted_positives() {
        let report = ClassificationReport::evaluate(&[true, false], &[0.1, 0.2], 0.5);
        assert_eq!(report.fraud.precision, 0.0);
        assert_eq!(report.fraud.f1, 0.0);
    }

    #[test]
    fn test_threshold_boundary_is_legitimate() {
        let report = ClassificationReport::evaluate(&[false, true], &[0.5, 0.5], 0.5);
        assert_eq!(report.legitimate.recall, 1.0);
        assert_eq!(report.fraud.recall, 0.0);
        assert!(!PredictionResult::from_probability(0.5).predicted_label);
    }
}

//! Native gradient-boosted tree ensemble
//!
//! This is the artifact written by the trainer (`model.json`). It scores
//! dense feature vectors produced by `PreprocessSchema::encode`, where NaN
//! marks a missing value and categorical features carry their level code.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current model artifact version
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Logistic link
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Decision rule at an internal node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SplitRule {
    /// `x <= threshold` goes left; missing follows `default_left`
    Numeric { threshold: f64, default_left: bool },
    /// Category codes in the set go left; missing and unseen go right
    Categorical { left_categories: Vec<u32> },
}

impl SplitRule {
    pub fn goes_left(&self, value: f64) -> bool {
        match self {
            SplitRule::Numeric {
                threshold,
                default_left,
            } => {
                if value.is_nan() {
                    *default_left
                } else {
                    value <= *threshold
                }
            }
            SplitRule::Categorical { left_categories } => {
                if value.is_nan() || value < 0.0 || value.fract() != 0.0 {
                    false
                } else {
                    left_categories.contains(&(value as u32))
                }
            }
        }
    }
}

/// Node of a regression tree; `count` is the number of training rows that reached it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum TreeNode {
    Split {
        feature: usize,
        rule: SplitRule,
        left: usize,
        right: usize,
        count: u64,
    },
    Leaf {
        value: f64,
        count: u64,
    },
}

impl TreeNode {
    pub fn count(&self) -> u64 {
        match self {
            TreeNode::Split { count, .. } | TreeNode::Leaf { count, .. } => *count,
        }
    }
}

/// A single tree stored as a node array rooted at index 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    /// Tree with a single leaf
    pub fn leaf(value: f64, count: u64) -> Self {
        Self {
            nodes: vec![TreeNode::Leaf { value, count }],
        }
    }

    /// Output for one feature vector
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { value, .. } => return *value,
                TreeNode::Split {
                    feature,
                    rule,
                    left,
                    right,
                    ..
                } => {
                    let value = features.get(*feature).copied().unwrap_or(f64::NAN);
                    index = if rule.goes_left(value) { *left } else { *right };
                }
            }
        }
    }

    /// Cover-weighted mean of leaf values (the tree's expected output)
    pub fn expected_value(&self) -> f64 {
        let root_count = self.nodes.first().map(|n| n.count()).unwrap_or(0);
        if root_count == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .nodes
            .iter()
            .filter_map(|node| match node {
                TreeNode::Leaf { value, count } => Some(value * *count as f64),
                _ => None,
            })
            .sum();
        weighted / root_count as f64
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, TreeNode::Leaf { .. }))
            .count()
    }

    fn validate(&self, feature_count: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= feature_count {
                    return Err(format!("node {} splits on unknown feature {}", i, feature));
                }
                // Children always come after their parent, which also rules out cycles
                if *left <= i || *right <= i || *left >= self.nodes.len() || *right >= self.nodes.len() {
                    return Err(format!("node {} has invalid children", i));
                }
            }
        }
        Ok(())
    }
}

/// Gradient-boosted binary classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub version: u32,
    pub objective: String,
    /// Raw score before the first tree (log-odds)
    pub init_score: f64,
    /// Shrinkage used during training; leaf values already include it
    pub learning_rate: f64,
    pub feature_names: Vec<String>,
    /// Fingerprint of the preprocessing schema the model was fit against
    pub schema_fingerprint: String,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    pub fn new(
        init_score: f64,
        learning_rate: f64,
        feature_names: Vec<String>,
        schema_fingerprint: String,
    ) -> Self {
        Self {
            version: MODEL_FORMAT_VERSION,
            objective: "binary".to_string(),
            init_score,
            learning_rate,
            feature_names,
            schema_fingerprint,
            trees: Vec::new(),
        }
    }

    /// Load and validate a model artifact
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ModelLoad(format!("cannot read model {}: {}", path.display(), e))
        })?;
        let model: Self = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::ModelLoad(format!("corrupt model {}: {}", path.display(), e))
        })?;
        model
            .validate()
            .map_err(|e| PipelineError::ModelLoad(format!("invalid model {}: {}", path.display(), e)))?;
        Ok(model)
    }

    /// Persist the model as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.version != MODEL_FORMAT_VERSION {
            return Err(format!("unsupported model version {}", self.version));
        }
        if self.objective != "binary" {
            return Err(format!("unsupported objective '{}'", self.objective));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.feature_names.len())
                .map_err(|e| format!("tree {}: {}", i, e))?;
        }
        Ok(())
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }

    /// Raw margin (log-odds)
    pub fn predict_raw(&self, features: &[f64]) -> f64 {
        self.init_score + self.trees.iter().map(|t| t.predict(features)).sum::<f64>()
    }

    /// P(fraud = 1)
    pub fn predict_proba(&self, features: &[f64]) -> f64 {
        sigmoid(self.predict_raw(features))
    }

    /// Expected raw margin over the training distribution
    pub fn expected_value(&self) -> f64 {
        self.init_score + self.trees.iter().map(Tree::expected_value).sum::<f64>()
    }
}

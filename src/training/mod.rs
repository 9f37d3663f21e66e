//! Offline trainer: CSV in, `schema.json` and `model.json` out

pub mod dataset;
pub mod gbdt;
pub mod metrics;
pub mod tracking;

pub use dataset::{Dataset, DatasetSummary, PreparedData};
pub use gbdt::{GbdtParams, GbdtTrainer};
pub use metrics::{roc_auc, ClassificationReport};
pub use tracking::{ExperimentTracker, RunInfo};

use crate::config::TrainingConfig;
use crate::models::ensemble::TreeEnsemble;
use crate::preprocess::PreprocessSchema;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Decision threshold used for the held-out report
pub const REPORT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Row {row}: target value '{value}' is not 0 or 1")]
    InvalidTarget { row: usize, value: String },

    #[error("Dataset has no rows")]
    EmptyDataset,

    #[error("Training labels contain a single class")]
    SingleClass,

    #[error("Test fraction {0} must be strictly between 0 and 1")]
    InvalidSplit(f64),
}

impl TrainingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TrainingError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Stratified train/test split; returns sorted (train, test) row indices.
///
/// Each class contributes `round(n * test_fraction)` rows to the test set,
/// at least one when the class has two or more rows.
pub fn stratified_split(
    labels: &[bool],
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), TrainingError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(TrainingError::InvalidSplit(test_fraction));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut test = Vec::new();

    for class in [false, true] {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == class)
            .map(|(i, _)| i)
            .collect();
        members.shuffle(&mut rng);

        let mut n_test = (members.len() as f64 * test_fraction).round() as usize;
        if members.len() >= 2 {
            n_test = n_test.clamp(1, members.len() - 1);
        }
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    Ok((train, test))
}

/// Everything produced by one training run
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub schema: PreprocessSchema,
    pub model: TreeEnsemble,
    pub report: ClassificationReport,
    pub params: GbdtParams,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Paths written by `Trainer::persist`
#[derive(Debug, Clone)]
pub struct SavedArtifacts {
    pub model_path: PathBuf,
    pub schema_path: PathBuf,
}

pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn load_dataset(&self) -> Result<Dataset, TrainingError> {
        Dataset::from_csv(&self.config.dataset_path)
    }

    /// Prepare, split, fit and evaluate
    pub fn fit(&self, dataset: &Dataset) -> Result<TrainingOutcome, TrainingError> {
        let prepared = dataset.prepare(
            &self.config.target,
            &self.config.drop_columns,
            &self.config.numeric_features,
        )?;
        let (train_idx, test_idx) =
            stratified_split(&prepared.labels, self.config.test_fraction, self.config.seed)?;

        let select = |indices: &[usize]| -> (Vec<Vec<f64>>, Vec<bool>) {
            indices
                .iter()
                .map(|&i| (prepared.features[i].clone(), prepared.labels[i]))
                .unzip()
        };
        let (train_x, train_y) = select(&train_idx);
        let (test_x, test_y) = select(&test_idx);

        let positives = train_y.iter().filter(|l| **l).count();
        let negatives = train_y.len() - positives;
        if positives == 0 || negatives == 0 {
            return Err(TrainingError::SingleClass);
        }
        let scale_pos_weight = negatives as f64 / positives as f64;

        info!(
            train_rows = train_y.len(),
            test_rows = test_y.len(),
            features = prepared.schema.feature_count(),
            scale_pos_weight = scale_pos_weight,
            "Training classifier"
        );

        let params = GbdtParams {
            n_estimators: self.config.n_estimators,
            learning_rate: self.config.learning_rate,
            num_leaves: self.config.num_leaves,
            min_data_in_leaf: self.config.min_data_in_leaf,
            max_bin: self.config.max_bin,
            scale_pos_weight,
            eval_period: self.config.eval_period,
            ..GbdtParams::default()
        };
        let model = GbdtTrainer::new(params.clone()).fit(
            &prepared.schema,
            &train_x,
            &train_y,
            Some((test_x.as_slice(), test_y.as_slice())),
        )?;

        let probabilities: Vec<f64> = test_x.iter().map(|row| model.predict_proba(row)).collect();
        let report = ClassificationReport::evaluate(&test_y, &probabilities, REPORT_THRESHOLD);
        info!(
            roc_auc = report.roc_auc,
            f1 = report.f1(),
            trees = model.trees.len(),
            "Evaluation on held-out split"
        );

        Ok(TrainingOutcome {
            schema: prepared.schema,
            model,
            report,
            params,
            train_rows: train_y.len(),
            test_rows: test_y.len(),
        })
    }

    /// Write the model and schema artifacts the predictor loads
    pub fn persist(
        &self,
        outcome: &TrainingOutcome,
        models_dir: &Path,
        model_file: &str,
        schema_file: &str,
    ) -> Result<SavedArtifacts, TrainingError> {
        std::fs::create_dir_all(models_dir).map_err(|e| TrainingError::io(models_dir, e))?;

        let model_path = models_dir.join(model_file);
        outcome
            .model
            .save(&model_path)
            .map_err(|e| TrainingError::io(&model_path, e))?;

        let schema_path = models_dir.join(schema_file);
        outcome
            .schema
            .save(&schema_path)
            .map_err(|e| TrainingError::io(&schema_path, e))?;

        info!(model = %model_path.display(), schema = %schema_path.display(), "Artifacts saved");
        Ok(SavedArtifacts {
            model_path,
            schema_path,
        })
    }

    /// Log params, metrics and the model to the run store
    pub fn track(&self, outcome: &TrainingOutcome) -> Result<RunInfo, TrainingError> {
        let tracker = ExperimentTracker::new(&self.config.tracking_dir, &self.config.experiment);
        let dir = tracker.experiment_dir();
        let io = |e| TrainingError::io(&dir, e);

        let mut run = tracker.start_run().map_err(io)?;
        let p = &outcome.params;
        run.log_params([
            ("n_estimators", Value::from(p.n_estimators)),
            ("learning_rate", Value::from(p.learning_rate)),
            ("num_leaves", Value::from(p.num_leaves)),
            ("min_data_in_leaf", Value::from(p.min_data_in_leaf)),
            ("max_bin", Value::from(p.max_bin)),
            ("scale_pos_weight", Value::from(p.scale_pos_weight)),
            ("test_fraction", Value::from(self.config.test_fraction)),
            ("seed", Value::from(self.config.seed)),
        ])
        .map_err(io)?;
        run.log_metric("roc_auc", outcome.report.roc_auc).map_err(io)?;
        run.log_metric("f1_score", outcome.report.f1()).map_err(io)?;
        run.log_artifact("classification_report.json", &outcome.report)
            .map_err(io)?;
        run.log_model(&outcome.model).map_err(io)?;
        run.finish().map_err(io)
    }
}

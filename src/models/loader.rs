//! Model artifact loading: schema, classifier and explainer

use crate::config::{Explainability, ModelBackend, ModelsConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::models::ensemble::TreeEnsemble;
use crate::models::inference::{Classifier, OnnxClassifier, Predictor, TreeClassifier};
use crate::models::shap::{Explainer, TreeShapExplainer};
use crate::preprocess::PreprocessSchema;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Loaded ONNX model with metadata
pub struct LoadedModel {
    /// Model name
    pub name: String,
    /// ONNX Runtime session
    pub session: Session,
    /// Input name for the model
    pub input_name: String,
    /// Output name for probabilities
    pub output_name: String,
    /// Declared feature width of the input tensor; `None` when dynamic
    pub input_width: Option<usize>,
}

/// Loader for the persisted artifacts the trainer produces
pub struct ModelLoader {
    models_dir: PathBuf,
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a loader rooted at the artifact directory
    pub fn new<P: AsRef<Path>>(models_dir: P, onnx_threads: usize) -> Self {
        Self {
            models_dir: models_dir.as_ref().to_path_buf(),
            onnx_threads,
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.models_dir.join(file)
    }

    /// Load the preprocessing schema
    pub fn load_schema(&self, file: &str) -> PipelineResult<PreprocessSchema> {
        let path = self.path(file);
        let schema = PreprocessSchema::load(&path)?;
        info!(
            path = %path.display(),
            numeric = schema.numeric_cols.len(),
            categorical = schema.categorical_cols.len(),
            "Preprocessing schema loaded"
        );
        Ok(schema)
    }

    /// Load a native tree ensemble
    pub fn load_tree_ensemble(&self, file: &str) -> PipelineResult<TreeEnsemble> {
        let path = self.path(file);
        let model = TreeEnsemble::load(&path)?;
        info!(
            path = %path.display(),
            trees = model.trees.len(),
            features = model.feature_count(),
            "Tree ensemble loaded"
        );
        Ok(model)
    }

    /// Load an ONNX export of the classifier
    pub fn load_onnx(&self, file: &str, name: &str) -> PipelineResult<LoadedModel> {
        let path = self.path(file);
        if !path.exists() {
            return Err(PipelineError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        ort::init()
            .commit()
            .map_err(|e| PipelineError::ModelLoad(format!("ONNX Runtime init failed: {}", e)))?;

        info!(model = %name, path = %path.display(), threads = self.onnx_threads, "Loading ONNX model");

        let session = build_session(&path, self.onnx_threads).map_err(|e| {
            PipelineError::ModelLoad(format!("failed to load {}: {:#}", path.display(), e))
        })?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let input_width = session
            .inputs
            .first()
            .and_then(|i| i.input_type.tensor_shape())
            .and_then(|shape| shape.last().copied())
            .and_then(|dim| usize::try_from(dim).ok())
            .filter(|dim| *dim > 0);

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .map(|o| o.name.clone())
            .unwrap_or_else(|| {
                session
                    .outputs
                    .last()
                    .map(|o| o.name.clone())
                    .unwrap_or_else(|| "probabilities".to_string())
            });

        info!(
            model = %name,
            input = %input_name,
            output = %output_name,
            input_width = ?input_width,
            "Model loaded successfully"
        );

        Ok(LoadedModel {
            name: name.to_string(),
            session,
            input_name,
            output_name,
            input_width,
        })
    }

    /// Load schema, classifier and optional explainer and check they agree.
    ///
    /// Any missing or corrupt artifact is a `ModelLoad` error; a model fit
    /// against a different schema is a `SchemaMismatch`.
    pub fn load_predictor(&self, config: &ModelsConfig) -> PipelineResult<Predictor> {
        let schema = Arc::new(self.load_schema(&config.schema_file)?);

        let mut ensemble: Option<Arc<TreeEnsemble>> = None;
        let classifier: Arc<dyn Classifier> = match config.backend {
            ModelBackend::Tree => {
                let model = Arc::new(self.load_tree_ensemble(&config.model_file)?);
                check_compatibility(&model, &schema)?;
                ensemble = Some(model.clone());
                Arc::new(TreeClassifier::new(model))
            }
            ModelBackend::Onnx => {
                let loaded = self.load_onnx(&config.model_file, "classifier")?;
                check_input_width(loaded.input_width, &schema)?;
                if loaded.input_width.is_none() {
                    warn!(
                        model = %loaded.name,
                        "ONNX input width is dynamic, it is only checked when scoring"
                    );
                }
                Arc::new(OnnxClassifier::new(loaded))
            }
        };

        let explainer: Option<Arc<dyn Explainer>> = match config.explainability {
            Explainability::Off => None,
            Explainability::TreeShap => {
                let model = match (&config.explainer_file, ensemble) {
                    (Some(file), _) => {
                        let model = Arc::new(self.load_tree_ensemble(file)?);
                        check_compatibility(&model, &schema)?;
                        model
                    }
                    (None, Some(model)) => model,
                    (None, None) => {
                        return Err(PipelineError::ModelLoad(
                            "tree_shap explainability with the onnx backend needs models.explainer_file"
                                .to_string(),
                        ))
                    }
                };
                Some(Arc::new(TreeShapExplainer::new(model)))
            }
        };

        if explainer.is_none() {
            warn!("Explainability disabled, predictions will carry no risk factors");
        }

        Ok(Predictor::new(schema, classifier, explainer, config.missing_fields))
    }
}

fn build_session(path: &Path, onnx_threads: usize) -> anyhow::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(onnx_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

/// A model is only usable with the schema it was trained against
pub fn check_compatibility(model: &TreeEnsemble, schema: &PreprocessSchema) -> PipelineResult<()> {
    if model.schema_fingerprint != schema.fingerprint {
        return Err(PipelineError::SchemaMismatch(format!(
            "model was trained against schema {}, loaded schema is {}",
            model.schema_fingerprint, schema.fingerprint
        )));
    }
    if model.feature_names != schema.feature_names {
        return Err(PipelineError::SchemaMismatch(
            "model feature order differs from schema".to_string(),
        ));
    }
    Ok(())
}

/// An ONNX export must take exactly the schema's feature vector
pub fn check_input_width(declared: Option<usize>, schema: &PreprocessSchema) -> PipelineResult<()> {
    match declared {
        Some(width) if width != schema.feature_count() => Err(PipelineError::SchemaMismatch(format!(
            "ONNX model expects {} input features, schema {} has {}",
            width,
            schema.fingerprint,
            schema.feature_count()
        ))),
        _ => Ok(()),
    }
}

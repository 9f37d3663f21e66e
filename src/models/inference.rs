//! Claim scoring: classifier backends and the predictor that drives them

use crate::error::{PipelineError, PipelineResult};
use crate::models::ensemble::TreeEnsemble;
use crate::models::loader::LoadedModel;
use crate::models::shap::{top_attributions, Explainer};
use crate::preprocess::{MissingFieldPolicy, PreprocessSchema, Preprocessor, TypedRow};
use crate::types::claim::Claim;
use crate::types::prediction::{PredictionResult, RiskFactor, MAX_RISK_FACTORS};
use ort::memory::Allocator;
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Binary classifier over encoded feature vectors
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// P(fraud = 1)
    fn predict_proba(&self, features: &[f64]) -> PipelineResult<f64>;
}

/// Anything that can score a raw claim; the agent depends on this seam
pub trait ClaimScorer: Send + Sync {
    fn score(&self, claim: &Claim) -> PipelineResult<PredictionResult>;
}

/// Classifier backed by the native tree ensemble
pub struct TreeClassifier {
    model: Arc<TreeEnsemble>,
}

impl TreeClassifier {
    pub fn new(model: Arc<TreeEnsemble>) -> Self {
        Self { model }
    }
}

impl Classifier for TreeClassifier {
    fn name(&self) -> &str {
        "tree_ensemble"
    }

    fn predict_proba(&self, features: &[f64]) -> PipelineResult<f64> {
        if features.len() != self.model.feature_count() {
            return Err(PipelineError::SchemaMismatch(format!(
                "model expects {} features, got {}",
                self.model.feature_count(),
                features.len()
            )));
        }
        Ok(self.model.predict_proba(features))
    }
}

/// Classifier backed by an ONNX export (LightGBM / XGBoost converters)
pub struct OnnxClassifier {
    /// Session runs need exclusive access
    model: RwLock<LoadedModel>,
}

impl OnnxClassifier {
    pub fn new(model: LoadedModel) -> Self {
        Self {
            model: RwLock::new(model),
        }
    }

    /// Extract fraud probability from model output.
    /// Handles tensor outputs (XGBoost) and seq(map) outputs (LightGBM).
    fn extract_probability(
        outputs: &ort::session::SessionOutputs,
        output_name: &str,
        model_name: &str,
    ) -> PipelineResult<f64> {
        if let Some(output) = outputs.get(output_name) {
            let dtype = output.dtype();

            if let Ok(tensor) = output.try_extract_tensor::<f32>() {
                let (shape, data) = tensor;
                let prob = Self::fraud_prob_from_tensor(&shape, data);
                debug!(model = %model_name, prob = prob, "Extracted from tensor");
                return Ok(prob);
            }

            if DynSequenceValueType::can_downcast(&dtype) {
                if let Ok(prob) = Self::extract_from_sequence_map(output, model_name) {
                    return Ok(prob);
                }
            }
        }

        for (name, output) in outputs.iter() {
            if name.contains("label") {
                continue;
            }

            let dtype = output.dtype();

            if let Ok(tensor) = output.try_extract_tensor::<f32>() {
                let (shape, data) = tensor;
                let prob = Self::fraud_prob_from_tensor(&shape, data);
                debug!(model = %model_name, output = %name, prob = prob, "Extracted from tensor (fallback)");
                return Ok(prob);
            }

            if DynSequenceValueType::can_downcast(&dtype) {
                if let Ok(prob) = Self::extract_from_sequence_map(&output, model_name) {
                    return Ok(prob);
                }
            }
        }

        Err(PipelineError::Inference(format!(
            "no probability output found for model {}",
            model_name
        )))
    }

    /// Probability of class 1 from a seq(map(int64, float)) output
    fn extract_from_sequence_map(
        output: &ort::value::DynValue,
        model_name: &str,
    ) -> anyhow::Result<f64> {
        let allocator = Allocator::default();

        let sequence = output
            .downcast_ref::<DynSequenceValueType>()
            .map_err(|e| anyhow::anyhow!("Failed to downcast to sequence: {}", e))?;

        let maps = sequence.try_extract_sequence::<DynMapValueType>(&allocator)?;
        let map_value = maps
            .first()
            .ok_or_else(|| anyhow::anyhow!("Empty sequence"))?;

        // Batch size is always 1
        let kv_pairs = map_value.try_extract_key_values::<i64, f32>()?;

        if let Some((_, prob)) = kv_pairs.iter().find(|(class_id, _)| *class_id == 1) {
            debug!(model = %model_name, prob = *prob, "Extracted from seq(map)");
            return Ok(*prob as f64);
        }
        if let Some((_, prob)) = kv_pairs.iter().find(|(class_id, _)| *class_id == 0) {
            return Ok(1.0 - *prob as f64);
        }

        Err(anyhow::anyhow!("No probability found in map"))
    }

    fn fraud_prob_from_tensor(shape: &ort::tensor::Shape, data: &[f32]) -> f64 {
        let dims: Vec<i64> = shape.iter().copied().collect();
        let classes = dims.last().copied().unwrap_or(1);

        match (classes, data) {
            // [batch, 2] or [2]: fraud is class 1
            (c, [_, p, ..]) if c >= 2 => *p as f64,
            (_, [p, ..]) => *p as f64,
            _ => f64::NAN,
        }
    }
}

impl Classifier for OnnxClassifier {
    fn name(&self) -> &str {
        "onnx"
    }

    fn predict_proba(&self, features: &[f64]) -> PipelineResult<f64> {
        use ort::value::Tensor;

        let shape = vec![1_i64, features.len() as i64];
        let input: Vec<f32> = features.iter().map(|&v| v as f32).collect();
        let input_tensor = Tensor::from_array((shape, input))
            .map_err(|e| PipelineError::Inference(format!("failed to create input tensor: {}", e)))?;

        let mut model = self
            .model
            .write()
            .map_err(|e| PipelineError::Inference(format!("lock error: {}", e)))?;
        let model_name = model.name.clone();
        let input_name = model.input_name.clone();
        let output_name = model.output_name.clone();

        let outputs = model
            .session
            .run(ort::inputs![input_name.as_str() => input_tensor])
            .map_err(|e| PipelineError::SchemaMismatch(format!("ONNX run rejected input: {}", e)))?;

        let probability = Self::extract_probability(&outputs, &output_name, &model_name)?;
        Ok(probability)
    }
}

/// Scores claims with a persisted classifier and optional explainer.
///
/// Built once at startup and shared read-only between workers.
pub struct Predictor {
    preprocessor: Preprocessor,
    schema: Arc<PreprocessSchema>,
    classifier: Arc<dyn Classifier>,
    explainer: Option<Arc<dyn Explainer>>,
}

impl Predictor {
    pub fn new(
        schema: Arc<PreprocessSchema>,
        classifier: Arc<dyn Classifier>,
        explainer: Option<Arc<dyn Explainer>>,
        missing_fields: MissingFieldPolicy,
    ) -> Self {
        Self {
            preprocessor: Preprocessor::new(schema.clone(), missing_fields),
            schema,
            classifier,
            explainer,
        }
    }

    pub fn explainability_enabled(&self) -> bool {
        self.explainer.is_some()
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    pub fn schema(&self) -> &PreprocessSchema {
        &self.schema
    }

    /// Preprocess and score a claim
    pub fn predict(&self, claim: &Claim) -> PipelineResult<PredictionResult> {
        let row = self.preprocessor.preprocess(claim)?;
        self.predict_row(&row, claim)
    }

    /// Score an already preprocessed row; `claim` supplies raw values for risk factors
    pub fn predict_row(&self, row: &TypedRow, claim: &Claim) -> PipelineResult<PredictionResult> {
        let features = self.schema.encode(row)?;
        let probability = self.classifier.predict_proba(&features)?;

        if !(0.0..=1.0).contains(&probability) {
            return Err(PipelineError::Inference(format!(
                "classifier returned probability {} outside [0, 1]",
                probability
            )));
        }

        let mut result = PredictionResult::from_probability(probability);

        if let Some(explainer) = &self.explainer {
            let attributions = explainer.attributions(&features)?;
            let names = explainer.feature_names();
            let factors = top_attributions(&attributions, MAX_RISK_FACTORS)
                .into_iter()
                .map(|i| RiskFactor {
                    feature: names[i].clone(),
                    value: claim.display_value(&names[i]),
                    attribution: attributions[i],
                })
                .collect();
            result = result.with_risk_factors(factors);
        }

        debug!(
            classifier = self.classifier.name(),
            probability = probability,
            risk_level = %result.risk_level,
            "Claim scored"
        );

        Ok(result)
    }
}

impl ClaimScorer for Predictor {
    fn score(&self, claim: &Claim) -> PipelineResult<PredictionResult> {
        self.predict(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ensemble::{SplitRule, Tree, TreeNode};
    use crate::models::shap::TreeShapExplainer;
    use crate::preprocess::tests::{sample_claim, sample_schema};

    /// Fixed-output classifier
    struct ConstantClassifier(f64);

    impl Classifier for ConstantClassifier {
        fn name(&self) -> &str {
            "constant"
        }

        fn predict_proba(&self, _features: &[f64]) -> PipelineResult<f64> {
            Ok(self.0)
        }
    }

    fn schema_model() -> (Arc<PreprocessSchema>, Arc<TreeEnsemble>) {
        let schema = sample_schema();
        let mut model = TreeEnsemble::new(
            -0.5,
            0.05,
            schema.feature_names.clone(),
            schema.fingerprint.clone(),
        );
        // Age <= 30 left, else split on Fault == "Policy Holder" (code 0)
        model.trees.push(Tree {
            nodes: vec![
                TreeNode::Split {
                    feature: 0,
                    rule: SplitRule::Numeric {
                        threshold: 30.0,
                        default_left: true,
                    },
                    left: 1,
                    right: 2,
                    count: 100,
                },
                TreeNode::Leaf {
                    value: -0.4,
                    count: 30,
                },
                TreeNode::Split {
                    feature: 2,
                    rule: SplitRule::Categorical {
                        left_categories: vec![0],
                    },
                    left: 3,
                    right: 4,
                    count: 70,
                },
                TreeNode::Leaf {
                    value: 1.6,
                    count: 20,
                },
                TreeNode::Leaf {
                    value: -0.2,
                    count: 50,
                },
            ],
        });
        (Arc::new(schema), Arc::new(model))
    }

    fn explained_predictor() -> Predictor {
        let (schema, model) = schema_model();
        Predictor::new(
            schema,
            Arc::new(TreeClassifier::new(model.clone())),
            Some(Arc::new(TreeShapExplainer::new(model))),
            MissingFieldPolicy::Reject,
        )
    }

    #[test]
    fn test_predict_with_explainer() {
        let predictor = explained_predictor();
        let result = predictor.predict(&sample_claim()).unwrap();

        // Age 34 and Fault "Policy Holder": -0.5 + 1.6
        let expected = 1.0 / (1.0 + (-1.1f64).exp());
        assert!((result.fraud_probability - expected).abs() < 1e-12);
        assert!(result.predicted_label);
        assert_eq!(result.risk_level.as_str(), "high");

        assert!(result.key_risk_factors.len() <= MAX_RISK_FACTORS);
        let labels = result.risk_factor_labels();
        assert!(labels.contains(&"Fault: Policy Holder".to_string()));
        assert!(labels.contains(&"Age: 34".to_string()));
        // Unused features tie at zero and follow column order
        assert_eq!(labels[2], "VehiclePrice: 20000 to 29000");
    }

    #[test]
    fn test_predict_without_explainer() {
        let (schema, model) = schema_model();
        let predictor = Predictor::new(
            schema,
            Arc::new(TreeClassifier::new(model)),
            None,
            MissingFieldPolicy::Reject,
        );
        let result = predictor.predict(&sample_claim()).unwrap();
        assert!(result.key_risk_factors.is_empty());
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let predictor = explained_predictor();
        let first = predictor.predict(&sample_claim()).unwrap();
        let second = predictor.predict(&sample_claim()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_missing_field_surfaces() {
        let predictor = explained_predictor();
        let claim = Claim::new().with("Age", 50);
        assert!(matches!(
            predictor.predict(&claim),
            Err(PipelineError::MissingClaimField(_))
        ));
    }

    #[test]
    fn test_row_with_foreign_columns_is_schema_mismatch() {
        let predictor = explained_predictor();
        let row = TypedRow { columns: Vec::new() };
        assert!(matches!(
            predictor.predict_row(&row, &Claim::new()),
            Err(PipelineError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_out_of_range_probability_rejected() {
        let (schema, _) = schema_model();
        let predictor = Predictor::new(
            schema,
            Arc::new(ConstantClassifier(1.5)),
            None,
            MissingFieldPolicy::Reject,
        );
        assert!(matches!(
            predictor.predict(&sample_claim()),
            Err(PipelineError::Inference(_))
        ));
    }

    #[test]
    fn test_constant_classifier_tiers() {
        let (schema, _) = schema_model();
        let predictor = Predictor::new(
            schema,
            Arc::new(ConstantClassifier(0.3)),
            None,
            MissingFieldPolicy::Reject,
        );
        let result = predictor.score(&sample_claim()).unwrap();
        assert_eq!(result.risk_level.as_str(), "medium");
        assert!(!result.predicted_label);
    }
}

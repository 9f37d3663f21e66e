//! Fraud scoring: model artifacts, inference and explanations

pub mod ensemble;
pub mod inference;
pub mod loader;
pub mod shap;

pub use ensemble::TreeEnsemble;
pub use inference::{ClaimScorer, Classifier, Predictor};
pub use loader::ModelLoader;
pub use shap::{Explainer, TreeShapExplainer};

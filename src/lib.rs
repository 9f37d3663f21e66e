//! Insurance Claim Fraud Investigation Pipeline
//!
//! Scores claims with a gradient-boosted classifier, explains the score with
//! TreeSHAP, retrieves matching fraud rules and asks a language model for an
//! investigation report. The offline trainer produces the model and schema
//! artifacts the predictor loads.

pub mod agent;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod preprocess;
pub mod producer;
pub mod retrieval;
pub mod training;
pub mod types;

pub use agent::InvestigationAgent;
pub use config::AppConfig;
pub use consumer::ClaimConsumer;
pub use error::{PipelineError, PipelineResult};
pub use models::inference::Predictor;
pub use preprocess::{PreprocessSchema, Preprocessor};
pub use producer::ReportProducer;
pub use training::{Trainer, TrainingError};
pub use types::{Claim, InvestigationReport, PredictionResult, RiskLevel};

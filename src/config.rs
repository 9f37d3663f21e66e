//! Configuration management for the investigation pipeline

use crate::preprocess::MissingFieldPolicy;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Which classifier artifact to score with
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    /// Native tree ensemble (`model.json`)
    #[default]
    Tree,
    /// ONNX export run through ONNX Runtime
    Onnx,
}

/// Per-prediction explanations
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Explainability {
    Off,
    #[default]
    TreeShap,
}

/// Where rule text comes from
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    /// Whole rules file, regardless of the claim
    #[default]
    Static,
    /// Top-k nearest rule documents from the vector index
    Semantic,
}

/// Embedding provider for the semantic index
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Local hashed term-frequency embedding, no network
    #[default]
    Local,
    /// OpenAI embeddings endpoint
    OpenAi,
}

/// Shape of the agent's answer
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Free-form narrative
    #[default]
    Text,
    /// Strict JSON investigation verdict
    Json,
}

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub models: ModelsConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub pipeline: PipelineConfig,
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject for incoming claims
    pub claim_subject: String,
    /// Subject for outgoing investigation reports
    pub report_subject: String,
}

/// Model artifact configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory holding the trainer's artifacts
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default)]
    pub backend: ModelBackend,
    /// Classifier artifact, relative to `models_dir`
    #[serde(default = "default_model_file")]
    pub model_file: String,
    #[serde(default = "default_schema_file")]
    pub schema_file: String,
    #[serde(default)]
    pub explainability: Explainability,
    /// Tree ensemble used for explanations when the classifier is an ONNX export
    #[serde(default)]
    pub explainer_file: Option<String>,
    #[serde(default)]
    pub missing_fields: MissingFieldPolicy,
    /// Number of threads for ONNX inference (default: 1)
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

fn default_models_dir() -> String {
    "models".to_string()
}

fn default_model_file() -> String {
    "model.json".to_string()
}

fn default_schema_file() -> String {
    "schema.json".to_string()
}

fn default_onnx_threads() -> usize {
    1
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            backend: ModelBackend::Tree,
            model_file: default_model_file(),
            schema_file: default_schema_file(),
            explainability: Explainability::TreeShap,
            explainer_file: None,
            missing_fields: MissingFieldPolicy::Reject,
            onnx_threads: default_onnx_threads(),
        }
    }
}

impl ModelsConfig {
    /// Where a trained tree ensemble belongs: the classifier file for the tree
    /// backend, the explainer file next to an ONNX classifier.
    ///
    /// `None` when the ONNX deployment has no separate explainer file.
    pub fn ensemble_file(&self) -> Option<&str> {
        match self.backend {
            ModelBackend::Tree => Some(&self.model_file),
            ModelBackend::Onnx => self
                .explainer_file
                .as_deref()
                .filter(|file| *file != self.model_file),
        }
    }
}

/// Rule retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub strategy: RetrievalStrategy,
    /// Plain-text rules file (static strategy and index loading)
    pub rules_file: String,
    /// Persisted vector index (semantic strategy)
    pub index_path: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub embedder: EmbedderKind,
    /// Embedding model name for the OpenAI embedder
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Dimension of the local hashing embedder
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    /// Query timeout in milliseconds
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
    /// Degrade to the static rules file when the index is unavailable
    #[serde(default = "default_true")]
    pub fallback_to_static: bool,
}

fn default_top_k() -> usize {
    3
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    256
}

fn default_retrieval_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

/// Retry policy for upstream calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Investigation agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Chat-completions base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    30
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Claims investigated concurrently
    pub workers: usize,
    /// Seconds between metric summaries
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

/// Offline trainer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub dataset_path: String,
    pub target: String,
    pub drop_columns: Vec<String>,
    pub numeric_features: Vec<String>,
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub num_leaves: usize,
    pub min_data_in_leaf: usize,
    pub max_bin: usize,
    /// Log eval AUC every this many trees (0 disables)
    #[serde(default = "default_eval_period")]
    pub eval_period: usize,
    pub tracking_dir: String,
    pub experiment: String,
}

fn default_test_fraction() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_eval_period() -> usize {
    50
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path, overridden by `FRAUD__*` variables
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("FRAUD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_path: "data/raw/insurance_claims.csv".to_string(),
            target: "FraudFound_P".to_string(),
            drop_columns: ["PolicyNumber", "RepNumber", "AddressChange_Claim", "Year"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            numeric_features: [
                "Age",
                "VehiclePrice",
                "Deductible",
                "DriverRating",
                "Days_Policy_Accident",
                "Days_Policy_Claim",
                "PastNumberOfClaims",
                "AgeOfVehicle",
                "AgeOfPolicyHolder",
                "NumberOfSuppliments",
                "NumberOfCars",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            test_fraction: default_test_fraction(),
            seed: default_seed(),
            n_estimators: 500,
            learning_rate: 0.05,
            num_leaves: 31,
            min_data_in_leaf: 20,
            max_bin: 255,
            eval_period: default_eval_period(),
            tracking_dir: "mlruns".to_string(),
            experiment: "insurance_claim_fraud_detection".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                claim_subject: "claims".to_string(),
                report_subject: "fraud.investigations".to_string(),
            },
            models: ModelsConfig::default(),
            retrieval: RetrievalConfig {
                strategy: RetrievalStrategy::Static,
                rules_file: "data/fraud_rules.txt".to_string(),
                index_path: "models/rule_index.json".to_string(),
                top_k: default_top_k(),
                embedder: EmbedderKind::Local,
                embedding_model: default_embedding_model(),
                dimensions: default_embedding_dimensions(),
                timeout_ms: default_retrieval_timeout_ms(),
                fallback_to_static: true,
            },
            agent: AgentConfig {
                model: "gpt-4o-mini".to_string(),
                temperature: default_temperature(),
                output_mode: OutputMode::Text,
                endpoint: default_endpoint(),
                timeout_secs: default_agent_timeout_secs(),
                api_key_env: default_api_key_env(),
                retry: RetryConfig::default(),
            },
            pipeline: PipelineConfig {
                workers: 4,
                metrics_interval_secs: default_metrics_interval_secs(),
            },
            training: TrainingConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.models.backend, ModelBackend::Tree);
        assert_eq!(config.models.explainability, Explainability::TreeShap);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.agent.temperature, 0.2);
        assert_eq!(config.agent.output_mode, OutputMode::Text);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.numeric_features.len(), 11);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = AppConfig::load_from_path(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/config.toml"
        ))
        .unwrap();
        let defaults = AppConfig::default();

        assert_eq!(config.nats.claim_subject, defaults.nats.claim_subject);
        assert_eq!(config.models.model_file, defaults.models.model_file);
        assert_eq!(config.retrieval.rules_file, defaults.retrieval.rules_file);
        assert_eq!(config.agent.model, defaults.agent.model);
        assert_eq!(config.training.drop_columns, defaults.training.drop_columns);
        assert_eq!(config.training.n_estimators, 500);
    }

    #[test]
    fn test_ensemble_file_never_targets_onnx_classifier() {
        let mut models = ModelsConfig::default();
        assert_eq!(models.ensemble_file(), Some("model.json"));

        models.backend = ModelBackend::Onnx;
        models.model_file = "model.onnx".to_string();
        assert_eq!(models.ensemble_file(), None);

        models.explainer_file = Some("model.onnx".to_string());
        assert_eq!(models.ensemble_file(), None);

        models.explainer_file = Some("explainer.json".to_string());
        assert_eq!(models.ensemble_file(), Some("explainer.json"));
    }

    #[test]
    fn test_enum_spellings() {
        #[derive(Deserialize)]
        struct Probe {
            explainability: Explainability,
            strategy: RetrievalStrategy,
            output_mode: OutputMode,
            missing_fields: MissingFieldPolicy,
        }

        let probe: Probe = serde_json::from_str(
            r#"{"explainability":"tree_shap","strategy":"semantic","output_mode":"json","missing_fields":"impute"}"#,
        )
        .unwrap();
        assert_eq!(probe.explainability, Explainability::TreeShap);
        assert_eq!(probe.strategy, RetrievalStrategy::Semantic);
        assert_eq!(probe.output_mode, OutputMode::Json);
        assert_eq!(probe.missing_fields, MissingFieldPolicy::Impute);
    }
}

//! Error taxonomy for the investigation pipeline

use thiserror::Error;

/// Errors surfaced by the per-claim investigation path and by startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Model, schema or explainer artifacts are absent or corrupt
    #[error("Failed to load model artifacts: {0}")]
    ModelLoad(String),

    /// Row columns do not line up with what the model was trained on
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Claim lacks a field the preprocessing schema declares
    #[error("Claim is missing required field '{0}'")]
    MissingClaimField(String),

    /// Model evaluation failed after a successful load
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Rule file or vector index cannot be reached
    #[error("Rule store unavailable: {0}")]
    RuleStoreUnavailable(String),

    /// Network, auth or rate-limit failure from the language-model provider
    #[error("Upstream service error: {0}")]
    UpstreamService(String),

    /// Language-model output was not the JSON verdict that was asked for
    #[error("Failed to parse model response: {0}")]
    ResponseParse(String),

    /// API credentials missing or unusable
    #[error("Auth configuration error: {0}")]
    AuthConfiguration(String),
}

impl PipelineError {
    /// Short machine-readable kind, used in logs, metrics and failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ModelLoad(_) => "model_load",
            PipelineError::SchemaMismatch(_) => "schema_mismatch",
            PipelineError::MissingClaimField(_) => "missing_claim_field",
            PipelineError::Inference(_) => "inference",
            PipelineError::RuleStoreUnavailable(_) => "rule_store_unavailable",
            PipelineError::UpstreamService(_) => "upstream_service",
            PipelineError::ResponseParse(_) => "response_parse",
            PipelineError::AuthConfiguration(_) => "auth_configuration",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::RuleStoreUnavailable("gone".into()).kind(),
            "rule_store_unavailable"
        );
        assert_eq!(
            PipelineError::MissingClaimField("Age".into()).to_string(),
            "Claim is missing required field 'Age'"
        );
    }
}

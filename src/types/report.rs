//! Investigation verdicts and the reports published for each claim

use crate::types::prediction::{PredictionResult, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Action the investigator recommends for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecommendedAction {
    Approve,
    #[serde(rename = "Manual Review", alias = "ManualReview", alias = "manual_review")]
    ManualReview,
    #[serde(
        rename = "Escalate Investigation",
        alias = "EscalateInvestigation",
        alias = "escalate_investigation"
    )]
    EscalateInvestigation,
    Reject,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Approve => "Approve",
            RecommendedAction::ManualReview => "Manual Review",
            RecommendedAction::EscalateInvestigation => "Escalate Investigation",
            RecommendedAction::Reject => "Reject",
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured verdict returned by the language model in JSON mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationVerdict {
    pub risk_level: RiskLevel,
    pub fraud_probability: f64,
    pub key_risk_factors: Vec<String>,
    pub justification: String,
    pub recommended_action: RecommendedAction,
}

/// What the language model produced for a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Findings {
    /// Free-form narrative assessment
    Text { narrative: String },
    /// Parsed strict-JSON verdict
    Json { verdict: InvestigationVerdict },
}

/// Outcome status of an investigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Completed,
    Unavailable,
}

/// Report published for every investigated claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationReport {
    /// Unique report identifier
    pub report_id: String,

    /// Claim identifier (policy number or generated)
    pub claim_id: String,

    pub status: InvestigationStatus,

    /// Model prediction, absent if scoring itself failed
    pub prediction: Option<PredictionResult>,

    /// Rule snippets given to the investigator
    pub rules: Vec<String>,

    /// Whether static rule text stood in for the semantic index
    pub rules_fallback: bool,

    pub findings: Option<Findings>,

    /// Error kind and message when the investigation is unavailable
    pub error_kind: Option<String>,
    pub error: Option<String>,

    /// Report generation timestamp
    pub timestamp: DateTime<Utc>,
}

impl InvestigationReport {
    /// Create a completed report
    pub fn completed(
        claim_id: String,
        prediction: PredictionResult,
        rules: Vec<String>,
        findings: Findings,
    ) -> Self {
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            claim_id,
            status: InvestigationStatus::Completed,
            prediction: Some(prediction),
            rules,
            rules_fallback: false,
            findings: Some(findings),
            error_kind: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an "investigation unavailable" report
    pub fn unavailable(claim_id: String, error_kind: &str, error: String) -> Self {
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            claim_id,
            status: InvestigationStatus::Unavailable,
            prediction: None,
            rules: Vec::new(),
            rules_fallback: false,
            findings: None,
            error_kind: Some(error_kind.to_string()),
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    /// Mark that static rules replaced the semantic index
    pub fn with_rules_fallback(mut self, fallback: bool) -> Self {
        self.rules_fallback = fallback;
        self
    }

    /// Keep the prediction on a failed report when scoring succeeded
    pub fn with_prediction(mut self, prediction: Option<PredictionResult>) -> Self {
        self.prediction = prediction;
        self
    }

    /// Recommended action, when the findings are a structured verdict
    pub fn recommended_action(&self) -> Option<RecommendedAction> {
        match &self.findings {
            Some(Findings::Json { verdict }) => Some(verdict.recommended_action),
            _ => None,
        }
    }
}

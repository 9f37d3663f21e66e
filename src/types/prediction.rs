//! Prediction results and risk tiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Probability below which a claim is low risk
pub const MEDIUM_RISK_FLOOR: f64 = 0.3;
/// Probability at or above which a claim is high risk
pub const HIGH_RISK_FLOOR: f64 = 0.7;
/// Probability strictly above which a claim is labelled fraudulent
pub const FRAUD_LABEL_THRESHOLD: f64 = 0.5;
/// Maximum number of risk factors reported per prediction
pub const MAX_RISK_FACTORS: usize = 5;

/// Risk tier classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[serde(alias = "Low", alias = "LOW")]
    Low,
    #[serde(alias = "Medium", alias = "MEDIUM")]
    Medium,
    #[serde(alias = "High", alias = "HIGH")]
    High,
}

impl RiskLevel {
    /// Bucket a fraud probability; boundaries resolve to the higher tier
    pub fn from_probability(probability: f64) -> Self {
        if probability < MEDIUM_RISK_FLOOR {
            RiskLevel::Low
        } else if probability < HIGH_RISK_FLOOR {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature that pushed the score, with the claim's raw value for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub feature: String,
    pub value: String,
    /// Signed log-odds contribution
    pub attribution: f64,
}

impl fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.feature, self.value)
    }
}

/// Result of scoring a single claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// P(fraud = 1)
    pub fraud_probability: f64,
    pub predicted_label: bool,
    pub risk_level: RiskLevel,
    /// At most five factors, most important first; empty without an explainer
    pub key_risk_factors: Vec<RiskFactor>,
}

impl PredictionResult {
    /// Build a result from a probability, deriving label and tier
    pub fn from_probability(fraud_probability: f64) -> Self {
        Self {
            fraud_probability,
            predicted_label: fraud_probability > FRAUD_LABEL_THRESHOLD,
            risk_level: RiskLevel::from_probability(fraud_probability),
            key_risk_factors: Vec::new(),
        }
    }

    /// Attach explained risk factors
    pub fn with_risk_factors(mut self, factors: Vec<RiskFactor>) -> Self {
        self.key_risk_factors = factors;
        self
    }

    /// Factors rendered as "<feature>: <value>"
    pub fn risk_factor_labels(&self) -> Vec<String> {
        self.key_risk_factors.iter().map(ToString::to_string).collect()
    }
}

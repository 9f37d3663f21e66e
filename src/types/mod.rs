//! Type definitions for the investigation pipeline

pub mod claim;
pub mod prediction;
pub mod report;

pub use claim::Claim;
pub use prediction::{PredictionResult, RiskFactor, RiskLevel};
pub use report::{
    Findings, InvestigationReport, InvestigationStatus, InvestigationVerdict, RecommendedAction,
};

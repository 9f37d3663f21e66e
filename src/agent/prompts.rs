//! Prompts for claim investigation

use crate::config::OutputMode;
use crate::types::claim::Claim;
use crate::types::prediction::PredictionResult;

/// System prompt for claim investigation
pub const INVESTIGATION_SYSTEM_PROMPT: &str = r#"You are an insurance fraud investigator.

Your role is to review a claim that a fraud model has already scored, using
the fraud policy rules you are given.

You must:
- Base conclusions on the model prediction, the listed risk factors and the rules provided
- Treat the model output as evidence, not as a decision
- Be conservative when the evidence is weak

Do not:
- Invent claim details that are not in the claim data
- Cite rules that were not provided

Your recommendation is advisory only; a human adjuster makes the final decision."#;

/// Output instructions appended in JSON mode
pub const VERDICT_JSON_INSTRUCTIONS: &str = r#"Respond with a single JSON object and nothing else, using exactly these keys:
{
  "risk_level": "low" | "medium" | "high",
  "fraud_probability": number between 0 and 1,
  "key_risk_factors": [string, ...],
  "justification": string,
  "recommended_action": "Approve" | "Manual Review" | "Escalate Investigation" | "Reject"
}"#;

/// Output instructions appended in text mode
pub const NARRATIVE_INSTRUCTIONS: &str = r#"Generate:
1. Risk Assessment
2. Key Suspicious Factors
3. Recommended Action (Approve, Manual Review, Escalate Investigation or Reject)"#;

/// Build the investigation prompt from the prediction, retrieved rules and raw claim
pub fn build_investigation_prompt(
    prediction: &PredictionResult,
    rules: &[String],
    claim: &Claim,
    mode: OutputMode,
) -> String {
    let factors = if prediction.key_risk_factors.is_empty() {
        "Not available (explanations disabled).".to_string()
    } else {
        prediction
            .risk_factor_labels()
            .iter()
            .enumerate()
            .map(|(i, label)| format!("{}. {}", i + 1, label))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let knowledge = if rules.is_empty() {
        "No fraud rules were retrieved for this claim.".to_string()
    } else {
        rules
            .iter()
            .map(|rule| format!("- {}", rule))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let instructions = match mode {
        OutputMode::Text => NARRATIVE_INSTRUCTIONS,
        OutputMode::Json => VERDICT_JSON_INSTRUCTIONS,
    };

    format!(
        r#"## Model Prediction
Fraud Probability: {probability}
Predicted Fraud: {label}
Risk Level: {risk_level}

### Top Risk Factors
{factors}

## Fraud Knowledge Base
{knowledge}

## Claim Data
{claim}

{instructions}"#,
        probability = prediction.fraud_probability,
        label = prediction.predicted_label,
        risk_level = prediction.risk_level,
        factors = factors,
        knowledge = knowledge,
        claim = claim.to_json(),
        instructions = instructions,
    )
}

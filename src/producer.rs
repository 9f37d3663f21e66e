//! NATS message producer for investigation reports

use crate::types::report::InvestigationReport;
use anyhow::Result;
use async_nats::Client;
use tracing::debug;

/// Producer for publishing investigation reports to NATS
#[derive(Clone)]
pub struct ReportProducer {
    client: Client,
    subject: String,
}

impl ReportProducer {
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Publish one report
    pub async fn publish(&self, report: &InvestigationReport) -> Result<()> {
        let payload = encode_report(report)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(
            report_id = %report.report_id,
            claim_id = %report.claim_id,
            status = ?report.status,
            "Published investigation report"
        );

        Ok(())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// JSON payload published for a report
pub fn encode_report(report: &InvestigationReport) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::prediction::PredictionResult;
    use crate::types::report::Findings;

    #[test]
    fn test_unavailable_report_payload() {
        let report = InvestigationReport::unavailable(
            "1042".to_string(),
            "upstream_service",
            "rate limited".to_string(),
        );
        let payload = encode_report(&report).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["claim_id"], "1042");
        assert_eq!(value["status"], "unavailable");
        assert_eq!(value["error_kind"], "upstream_service");
        assert!(value["prediction"].is_null());
        assert_eq!(value["report_id"], report.report_id.as_str());
    }

    #[test]
    fn test_completed_report_payload_decodes() {
        let report = InvestigationReport::completed(
            "77".to_string(),
            PredictionResult::from_probability(0.82),
            vec!["No police report".to_string()],
            Findings::Text {
                narrative: "1. Risk Assessment: high".to_string(),
            },
        )
        .with_rules_fallback(true);

        let payload = encode_report(&report).unwrap();
        let decoded: InvestigationReport = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.claim_id, "77");
        assert!(decoded.rules_fallback);
        assert_eq!(decoded.rules, report.rules);
        assert_eq!(decoded.findings, report.findings);
    }
}

//! Investigation agent: prediction + retrieved rules + raw claim, one model call.

pub mod llm;
pub mod prompts;

use crate::config::{AgentConfig, AppConfig, OutputMode, RetryConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::models::inference::ClaimScorer;
use crate::models::loader::ModelLoader;
use crate::retrieval::{build_retrievers, RuleQuery, RuleRetriever, StaticRuleRetriever};
use crate::types::claim::Claim;
use crate::types::prediction::PredictionResult;
use crate::types::report::{Findings, InvestigationReport, InvestigationVerdict};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use llm::{read_api_key, with_retry, ChatMessage, ChatModel, ChatRequest, LlmError, OpenAiChatClient};
pub use prompts::{build_investigation_prompt, INVESTIGATION_SYSTEM_PROMPT};

/// Model call settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub output_mode: OutputMode,
    pub retry: RetryConfig,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            output_mode: config.output_mode,
            retry: config.retry.clone(),
        }
    }
}

/// Rules handed to the model for one claim
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedRules {
    pub snippets: Vec<String>,
    /// Static text stood in for an unavailable index
    pub fallback: bool,
}

/// Scores a claim, looks up rules and asks the language model for findings.
///
/// All collaborators are shared, read-only and built once at startup.
pub struct InvestigationAgent {
    scorer: Arc<dyn ClaimScorer>,
    retriever: Arc<dyn RuleRetriever>,
    fallback: Option<Arc<StaticRuleRetriever>>,
    chat: Arc<dyn ChatModel>,
    settings: AgentSettings,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl InvestigationAgent {
    pub fn new(
        scorer: Arc<dyn ClaimScorer>,
        retriever: Arc<dyn RuleRetriever>,
        chat: Arc<dyn ChatModel>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            scorer,
            retriever,
            fallback: None,
            chat,
            settings,
            metrics: None,
        }
    }

    /// Build every collaborator from configuration.
    ///
    /// The API key is checked first so a missing credential fails before any
    /// artifact is loaded.
    pub fn from_config(config: &AppConfig) -> PipelineResult<Self> {
        let api_key = read_api_key(&config.agent.api_key_env)?;

        let loader = ModelLoader::new(&config.models.models_dir, config.models.onnx_threads);
        let predictor = Arc::new(loader.load_predictor(&config.models)?);
        info!(
            classifier = predictor.classifier_name(),
            features = predictor.schema().feature_count(),
            explainability = predictor.explainability_enabled(),
            "Predictor ready"
        );

        let retrievers = build_retrievers(&config.retrieval, &config.agent.endpoint, Some(&api_key))?;
        let chat = Arc::new(OpenAiChatClient::new(
            api_key,
            &config.agent.endpoint,
            Duration::from_secs(config.agent.timeout_secs),
        )?);

        Ok(Self::new(
            predictor,
            retrievers.primary,
            chat,
            AgentSettings::from(&config.agent),
        )
        .with_fallback(retrievers.fallback))
    }

    /// Static rules used when the primary retriever is unavailable
    pub fn with_fallback(mut self, fallback: Option<Arc<StaticRuleRetriever>>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn output_mode(&self) -> OutputMode {
        self.settings.output_mode
    }

    /// Rule text for a claim, degrading to the static rules when configured
    pub async fn retrieve_rules(
        &self,
        claim: &Claim,
        prediction: &PredictionResult,
    ) -> PipelineResult<RetrievedRules> {
        let factors = prediction.risk_factor_labels();
        let query = RuleQuery::new(claim, &factors);

        match self.retriever.retrieve(&query).await {
            Ok(snippets) => Ok(RetrievedRules {
                snippets,
                fallback: false,
            }),
            Err(PipelineError::RuleStoreUnavailable(reason)) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        retriever = self.retriever.name(),
                        reason = %reason,
                        "Rule store unavailable, using static rules"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retrieval_fallback();
                    }
                    Ok(RetrievedRules {
                        snippets: fallback.retrieve(&query).await?,
                        fallback: true,
                    })
                }
                None => Err(PipelineError::RuleStoreUnavailable(reason)),
            },
            Err(e) => Err(e),
        }
    }

    /// The exact request sent to the language model
    pub fn build_request(
        &self,
        claim: &Claim,
        prediction: &PredictionResult,
        rules: &[String],
    ) -> ChatRequest {
        let prompt = build_investigation_prompt(prediction, rules, claim, self.settings.output_mode);
        ChatRequest {
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            json_mode: self.settings.output_mode == OutputMode::Json,
            messages: vec![
                ChatMessage::system(INVESTIGATION_SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
        }
    }

    /// One model call with bounded retry; the content is parsed per output mode
    pub async fn request_findings(&self, request: &ChatRequest) -> PipelineResult<Findings> {
        let content = with_retry(
            &self.settings.retry,
            || self.chat.complete(request),
            |_| {
                if let Some(metrics) = &self.metrics {
                    metrics.record_upstream_retry();
                }
            },
        )
        .await?;

        match self.settings.output_mode {
            OutputMode::Text => Ok(Findings::Text {
                narrative: content.trim().to_string(),
            }),
            OutputMode::Json => Ok(Findings::Json {
                verdict: parse_verdict(&content)?,
            }),
        }
    }

    /// Investigate one claim end to end
    pub async fn investigate(&self, claim: &Claim) -> PipelineResult<InvestigationReport> {
        let claim_id = claim_id_or_generated(claim);

        let prediction = self.scorer.score(claim)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_prediction(prediction.risk_level.as_str(), prediction.fraud_probability);
        }
        debug!(
            claim_id = %claim_id,
            probability = prediction.fraud_probability,
            risk_level = %prediction.risk_level,
            "Claim scored"
        );

        let rules = self.retrieve_rules(claim, &prediction).await?;
        let request = self.build_request(claim, &prediction, &rules.snippets);
        let findings = self.request_findings(&request).await?;

        if let (Some(metrics), Findings::Json { verdict }) = (&self.metrics, &findings) {
            metrics.record_verdict(verdict.recommended_action.as_str());
        }

        info!(
            claim_id = %claim_id,
            risk_level = %prediction.risk_level,
            rules = rules.snippets.len(),
            rules_fallback = rules.fallback,
            "Investigation completed"
        );

        Ok(
            InvestigationReport::completed(claim_id, prediction, rules.snippets, findings)
                .with_rules_fallback(rules.fallback),
        )
    }

    /// Like `investigate`, but failures become an "investigation unavailable" report
    pub async fn investigate_or_unavailable(&self, claim: &Claim) -> InvestigationReport {
        match self.investigate(claim).await {
            Ok(report) => report,
            Err(e) => {
                let claim_id = claim_id_or_generated(claim);
                warn!(claim_id = %claim_id, kind = e.kind(), error = %e, "Investigation unavailable");
                // Scoring is pure, so a later-stage failure still reports the prediction
                let prediction = match &e {
                    PipelineError::RuleStoreUnavailable(_)
                    | PipelineError::UpstreamService(_)
                    | PipelineError::ResponseParse(_) => self.scorer.score(claim).ok(),
                    _ => None,
                };
                InvestigationReport::unavailable(claim_id, e.kind(), e.to_string())
                    .with_prediction(prediction)
            }
        }
    }
}

fn claim_id_or_generated(claim: &Claim) -> String {
    claim
        .claim_id()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Parse a strict-JSON verdict.
///
/// A single surrounding markdown code fence is tolerated; anything else that
/// is not exactly one verdict object is a `ResponseParse` error.
pub fn parse_verdict(content: &str) -> PipelineResult<InvestigationVerdict> {
    let body = strip_code_fence(content.trim());
    let verdict: InvestigationVerdict = serde_json::from_str(body)
        .map_err(|e| PipelineError::ResponseParse(format!("invalid verdict JSON: {}", e)))?;

    if !(0.0..=1.0).contains(&verdict.fraud_probability) {
        return Err(PipelineError::ResponseParse(format!(
            "fraud_probability {} outside [0, 1]",
            verdict.fraud_probability
        )));
    }
    Ok(verdict)
}

fn strip_code_fence(s: &str) -> &str {
    match s.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{Embedder, HashingEmbedder, RuleIndex, SemanticRuleRetriever};
    use crate::types::prediction::{RiskFactor, RiskLevel};
    use crate::types::report::{InvestigationStatus, RecommendedAction};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scorer returning a fixed probability
    struct FixedScorer(f64);

    impl ClaimScorer for FixedScorer {
        fn score(&self, _claim: &Claim) -> PipelineResult<PredictionResult> {
            Ok(PredictionResult::from_probability(self.0).with_risk_factors(vec![RiskFactor {
                feature: "Fault".to_string(),
                value: "Policy Holder".to_string(),
                attribution: 0.7,
            }]))
        }
    }

    /// Retriever returning fixed snippets, or failing as unavailable
    struct FixedRetriever(Option<Vec<String>>);

    #[async_trait]
    impl RuleRetriever for FixedRetriever {
        async fn retrieve(&self, _query: &RuleQuery<'_>) -> PipelineResult<Vec<String>> {
            self.0
                .clone()
                .ok_or_else(|| PipelineError::RuleStoreUnavailable("index offline".to_string()))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    /// Chat model that records requests and replays scripted responses
    struct ScriptedChat {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        requests: Mutex<Vec<ChatRequest>>,
        calls: AtomicU32,
    }

    impl ScriptedChat {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn last_request(&self) -> ChatRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok("no script".to_string());
            }
            responses.remove(0)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn settings(mode: OutputMode) -> AgentSettings {
        AgentSettings {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            output_mode: mode,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                backoff_multiplier: 2.0,
            },
        }
    }

    fn claim() -> Claim {
        Claim::new()
            .with("Age", 34)
            .with("VehiclePrice", "20000 to 29000")
            .with("Deductible", 400)
            .with("Fault", "Policy Holder")
            .with("DriverRating", 2)
            .with("PolicyNumber", 1042)
    }

    fn snippets() -> Vec<String> {
        vec![
            "Claims filed within 15 days of policy start require review.".to_string(),
            "Policy holder at fault with no witness is a known staging pattern.".to_string(),
            "Vehicle price bands above 20000 correlate with inflated repair estimates.".to_string(),
        ]
    }

    fn agent(
        probability: f64,
        rules: Option<Vec<String>>,
        chat: Arc<ScriptedChat>,
        mode: OutputMode,
    ) -> InvestigationAgent {
        InvestigationAgent::new(
            Arc::new(FixedScorer(probability)),
            Arc::new(FixedRetriever(rules)),
            chat,
            settings(mode),
        )
    }

    const VERDICT: &str = r#"{
        "risk_level": "high",
        "fraud_probability": 0.82,
        "key_risk_factors": ["Fault: Policy Holder"],
        "justification": "At-fault policy holder matches a staging pattern.",
        "recommended_action": "Escalate Investigation"
    }"#;

    #[tokio::test]
    async fn test_end_to_end_prompt_composition() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok("1. Risk Assessment: high".to_string())]));
        let agent = agent(0.82, Some(snippets()), chat.clone(), OutputMode::Text);

        let report = agent.investigate(&claim()).await.unwrap();
        let prediction = report.prediction.clone().unwrap();
        assert_eq!(prediction.risk_level, RiskLevel::High);
        assert_eq!(report.claim_id, "1042");
        assert_eq!(report.rules, snippets());

        let request = chat.last_request();
        assert_eq!(request.temperature, 0.2);
        assert!(!request.json_mode);
        let prompt = &request.messages[1].content;
        for snippet in snippets() {
            assert!(prompt.contains(&snippet), "missing snippet {}", snippet);
        }
        assert!(prompt.contains("0.82"));
        assert!(prompt.contains("\"VehiclePrice\":\"20000 to 29000\""));
        assert_eq!(
            report.findings,
            Some(Findings::Text {
                narrative: "1. Risk Assessment: high".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_json_mode_parses_verdict() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok(VERDICT.to_string())]));
        let agent = agent(0.82, Some(snippets()), chat.clone(), OutputMode::Json);

        let report = agent.investigate(&claim()).await.unwrap();
        assert!(chat.last_request().json_mode);
        assert_eq!(
            report.recommended_action(),
            Some(RecommendedAction::EscalateInvestigation)
        );
    }

    #[tokio::test]
    async fn test_truncated_json_is_response_parse() {
        let truncated = &VERDICT[..VERDICT.len() / 2];
        let chat = Arc::new(ScriptedChat::new(vec![Ok(truncated.to_string())]));
        let agent = agent(0.82, Some(snippets()), chat, OutputMode::Json);

        let result = agent.investigate(&claim()).await;
        assert!(matches!(result, Err(PipelineError::ResponseParse(_))));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Err(LlmError::RateLimited {
                retry_after_secs: 0,
            }),
            Ok("narrative".to_string()),
        ]));
        let metrics = Arc::new(PipelineMetrics::new());
        let agent = agent(0.1, Some(snippets()), chat.clone(), OutputMode::Text)
            .with_metrics(metrics.clone());

        agent.investigate(&claim()).await.unwrap();
        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.upstream_retries.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_unavailable_report() {
        let failures = (0..3)
            .map(|_| {
                Err(LlmError::Connection {
                    message: "reset".to_string(),
                })
            })
            .collect();
        let chat = Arc::new(ScriptedChat::new(failures));
        let agent = agent(0.5, Some(snippets()), chat.clone(), OutputMode::Text);

        let report = agent.investigate_or_unavailable(&claim()).await;
        assert_eq!(report.status, InvestigationStatus::Unavailable);
        assert_eq!(report.error_kind.as_deref(), Some("upstream_service"));
        assert!(report.prediction.is_some());
        assert_eq!(chat.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unavailable_index_falls_back_to_static() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok("narrative".to_string())]));
        let agent = agent(0.4, None, chat.clone(), OutputMode::Text)
            .with_fallback(Some(Arc::new(StaticRuleRetriever::new("Static policy text"))));

        let report = agent.investigate(&claim()).await.unwrap();
        assert!(report.rules_fallback);
        assert_eq!(report.rules, vec!["Static policy text".to_string()]);
        assert!(chat.last_request().messages[1].content.contains("Static policy text"));
    }

    /// Embedder that never answers inside the retrieval timeout
    struct StalledEmbedder(HashingEmbedder);

    #[async_trait]
    impl Embedder for StalledEmbedder {
        async fn embed(&self, text: &str) -> PipelineResult<Vec<f32>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.embed(text).await
        }

        fn provider_name(&self) -> &str {
            self.0.provider_name()
        }

        fn model_name(&self) -> &str {
            self.0.model_name()
        }

        fn vector_dimensions(&self) -> Option<usize> {
            self.0.vector_dimensions()
        }
    }

    #[tokio::test]
    async fn test_timed_out_index_falls_back_to_static() {
        let corpus = snippets();
        let index = RuleIndex::build(&corpus, &HashingEmbedder::new(64)).await.unwrap();
        let semantic = SemanticRuleRetriever::new(
            Arc::new(index),
            Arc::new(StalledEmbedder(HashingEmbedder::new(64))),
            3,
            Duration::from_millis(1),
        )
        .unwrap();
        let chat = Arc::new(ScriptedChat::new(vec![Ok("narrative".to_string())]));
        let agent = InvestigationAgent::new(
            Arc::new(FixedScorer(0.4)),
            Arc::new(semantic),
            chat.clone(),
            settings(OutputMode::Text),
        )
        .with_fallback(Some(Arc::new(StaticRuleRetriever::new("Static policy text"))));

        let report = agent.investigate(&claim()).await.unwrap();
        assert!(report.rules_fallback);
        assert_eq!(report.rules, vec!["Static policy text".to_string()]);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_index_without_fallback() {
        let chat = Arc::new(ScriptedChat::new(Vec::new()));
        let agent = agent(0.4, None, chat.clone(), OutputMode::Text);

        let result = agent.investigate(&claim()).await;
        assert!(matches!(result, Err(PipelineError::RuleStoreUnavailable(_))));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parse_verdict_variants() {
        assert!(parse_verdict(VERDICT).is_ok());
        assert!(parse_verdict(&format!("```json\n{}\n```", VERDICT)).is_ok());
        assert!(matches!(
            parse_verdict("The claim looks suspicious."),
            Err(PipelineError::ResponseParse(_))
        ));
        let out_of_range = VERDICT.replace("0.82", "1.7");
        assert!(matches!(
            parse_verdict(&out_of_range),
            Err(PipelineError::ResponseParse(_))
        ));
        let bad_action = VERDICT.replace("Escalate Investigation", "Ignore");
        assert!(matches!(
            parse_verdict(&bad_action),
            Err(PipelineError::ResponseParse(_))
        ));
    }

    #[test]
    fn test_from_config_fails_fast_without_api_key() {
        let mut config = AppConfig::default();
        config.agent.api_key_env = "CLAIM_FRAUD_TEST_UNSET_API_KEY".to_string();
        // Artifacts do not exist either; the credential check must come first
        config.models.models_dir = "/nonexistent".to_string();
        assert!(matches!(
            InvestigationAgent::from_config(&config),
            Err(PipelineError::AuthConfiguration(_))
        ));
    }
}

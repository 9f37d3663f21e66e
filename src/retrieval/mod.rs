//! Fraud rule retrieval: the whole rules file, or top-k rule documents from
//! a vector index queried with the claim and its risk factors.

pub mod embedding;
pub mod index;

use crate::config::{EmbedderKind, RetrievalConfig, RetrievalStrategy};
use crate::error::{PipelineError, PipelineResult};
use crate::types::claim::Claim;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use embedding::{Embedder, HashingEmbedder, OpenAiEmbedder};
pub use index::{split_rules, RuleIndex, ScoredRule};

/// What the retriever is asked about
#[derive(Debug, Clone, Copy)]
pub struct RuleQuery<'a> {
    pub claim: &'a Claim,
    /// "feature: value" labels from the predictor
    pub risk_factors: &'a [String],
}

impl<'a> RuleQuery<'a> {
    pub fn new(claim: &'a Claim, risk_factors: &'a [String]) -> Self {
        Self {
            claim,
            risk_factors,
        }
    }

    /// Composite text that gets embedded for nearest-neighbour search
    pub fn to_query_text(&self) -> String {
        format!(
            "Claim data: {}\nKey risk factors: {}",
            self.claim.to_json(),
            self.risk_factors.join(", ")
        )
    }
}

/// Supplies fraud-policy text for a claim
#[async_trait]
pub trait RuleRetriever: Send + Sync {
    async fn retrieve(&self, query: &RuleQuery<'_>) -> PipelineResult<Vec<String>>;

    fn name(&self) -> &str;
}

/// One fixed text blob, whatever the query
#[derive(Debug, Clone)]
pub struct StaticRuleRetriever {
    text: String,
}

impl StaticRuleRetriever {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::RuleStoreUnavailable(format!("cannot read rules {}: {}", path.display(), e))
        })?;
        Ok(Self::new(text))
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[async_trait]
impl RuleRetriever for StaticRuleRetriever {
    async fn retrieve(&self, _query: &RuleQuery<'_>) -> PipelineResult<Vec<String>> {
        let text = self.text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![text.to_string()])
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Top-k nearest rule documents
pub struct SemanticRuleRetriever {
    index: Arc<RuleIndex>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    timeout: Duration,
}

impl SemanticRuleRetriever {
    /// The index must have been built with the same embedder
    pub fn new(
        index: Arc<RuleIndex>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        if !index.is_empty() {
            index.check_embedder(embedder.as_ref())?;
        }
        Ok(Self {
            index,
            embedder,
            top_k,
            timeout,
        })
    }

    /// Scored hits, most similar first
    pub async fn search(&self, query: &RuleQuery<'_>) -> PipelineResult<Vec<ScoredRule>> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }

        let text = query.to_query_text();
        let vector = tokio::time::timeout(self.timeout, self.embedder.embed(&text))
            .await
            .map_err(|_| {
                PipelineError::RuleStoreUnavailable(format!(
                    "rule query timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;
        if vector.len() != self.index.dimensions {
            return Err(PipelineError::RuleStoreUnavailable(format!(
                "query vector has {} dimensions, index has {}",
                vector.len(),
                self.index.dimensions
            )));
        }

        let hits = self.index.search(&vector, self.top_k);
        debug!(
            hits = hits.len(),
            top_score = hits.first().map(|h| h.score).unwrap_or(0.0),
            "Rule index queried"
        );
        Ok(hits)
    }
}

#[async_trait]
impl RuleRetriever for SemanticRuleRetriever {
    async fn retrieve(&self, query: &RuleQuery<'_>) -> PipelineResult<Vec<String>> {
        Ok(self.search(query).await?.into_iter().map(|h| h.text).collect())
    }

    fn name(&self) -> &str {
        "semantic"
    }
}

/// Embedder named by the configuration
pub fn build_embedder(
    config: &RetrievalConfig,
    endpoint: &str,
    api_key: Option<&str>,
) -> PipelineResult<Arc<dyn Embedder>> {
    match config.embedder {
        EmbedderKind::Local => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        EmbedderKind::OpenAi => {
            let key = api_key.ok_or_else(|| {
                PipelineError::AuthConfiguration("openai embedder needs an API key".to_string())
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                key.to_string(),
                &config.embedding_model,
                endpoint,
                Duration::from_millis(config.timeout_ms),
            )?))
        }
    }
}

/// Retriever named by the configuration, plus the static fallback when enabled
pub struct RetrieverSet {
    pub primary: Arc<dyn RuleRetriever>,
    pub fallback: Option<Arc<StaticRuleRetriever>>,
}

/// Build retrievers once at startup.
///
/// With the semantic strategy and `fallback_to_static`, an unreadable index
/// does not fail startup: the static file takes over and every query reports
/// the fallback.
pub fn build_retrievers(
    config: &RetrievalConfig,
    endpoint: &str,
    api_key: Option<&str>,
) -> PipelineResult<RetrieverSet> {
    match config.strategy {
        RetrievalStrategy::Static => {
            let retriever = Arc::new(StaticRuleRetriever::from_file(&config.rules_file)?);
            info!(path = %config.rules_file, "Static rule retriever ready");
            Ok(RetrieverSet {
                primary: retriever,
                fallback: None,
            })
        }
        RetrievalStrategy::Semantic => {
            let fallback = if config.fallback_to_static {
                Some(Arc::new(StaticRuleRetriever::from_file(&config.rules_file)?))
            } else {
                None
            };

            let primary: Arc<dyn RuleRetriever> = match RuleIndex::load(&config.index_path) {
                Ok(index) => {
                    let embedder = build_embedder(config, endpoint, api_key)?;
                    info!(
                        path = %config.index_path,
                        documents = index.len(),
                        top_k = config.top_k,
                        "Semantic rule retriever ready"
                    );
                    Arc::new(SemanticRuleRetriever::new(
                        Arc::new(index),
                        embedder,
                        config.top_k,
                        Duration::from_millis(config.timeout_ms),
                    )?)
                }
                Err(e) if fallback.is_some() => {
                    warn!(error = %e, "Rule index unavailable, queries will fall back to static rules");
                    Arc::new(UnavailableRetriever {
                        reason: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            };

            Ok(RetrieverSet { primary, fallback })
        }
    }
}

/// Stands in for an index that could not be opened
struct UnavailableRetriever {
    reason: String,
}

#[async_trait]
impl RuleRetriever for UnavailableRetriever {
    async fn retrieve(&self, _query: &RuleQuery<'_>) -> PipelineResult<Vec<String>> {
        Err(PipelineError::RuleStoreUnavailable(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

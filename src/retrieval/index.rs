//! Persisted vector index of fraud rule documents

use crate::error::{PipelineError, PipelineResult};
use crate::retrieval::embedding::Embedder;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

/// Current index file version
pub const INDEX_VERSION: u32 = 2;

/// One embedded rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDocument {
    /// `rule_<position>`
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Search hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRule {
    pub id: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleIndex {
    pub version: u32,
    /// Embedder that produced the vectors; queries must use the same one
    pub provider: String,
    pub model: String,
    /// Length of every document vector
    pub dimensions: usize,
    pub documents: Vec<RuleDocument>,
}

impl RuleIndex {
    pub fn empty(provider: &str, model: &str, dimensions: usize) -> Self {
        Self {
            version: INDEX_VERSION,
            provider: provider.to_string(),
            model: model.to_string(),
            dimensions,
            documents: Vec::new(),
        }
    }

    /// Embed every rule; ids follow corpus position
    pub async fn build(rules: &[String], embedder: &dyn Embedder) -> PipelineResult<Self> {
        let embeddings = embedder.embed_batch(rules).await?;
        let dimensions = embeddings
            .first()
            .map(Vec::len)
            .or(embedder.vector_dimensions())
            .unwrap_or(0);
        if let Some(bad) = embeddings.iter().position(|e| e.len() != dimensions) {
            return Err(PipelineError::RuleStoreUnavailable(format!(
                "embedding for rule_{} has {} dimensions, expected {}",
                bad,
                embeddings[bad].len(),
                dimensions
            )));
        }

        let documents = rules
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| RuleDocument {
                id: format!("rule_{}", i),
                text: text.clone(),
                embedding,
            })
            .collect();

        Ok(Self {
            version: INDEX_VERSION,
            provider: embedder.provider_name().to_string(),
            model: embedder.model_name().to_string(),
            dimensions,
            documents,
        })
    }

    /// Queries must come from the provider, model and vector size the index was built with
    pub fn check_embedder(&self, embedder: &dyn Embedder) -> PipelineResult<()> {
        if self.provider != embedder.provider_name() || self.model != embedder.model_name() {
            return Err(PipelineError::RuleStoreUnavailable(format!(
                "index was built with '{}/{}' embeddings, query embedder is '{}/{}'",
                self.provider,
                self.model,
                embedder.provider_name(),
                embedder.model_name()
            )));
        }
        match embedder.vector_dimensions() {
            Some(dimensions) if dimensions != self.dimensions => {
                Err(PipelineError::RuleStoreUnavailable(format!(
                    "index vectors have {} dimensions, query embedder produces {}",
                    self.dimensions, dimensions
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::RuleStoreUnavailable(format!("cannot read index {}: {}", path.display(), e))
        })?;
        let index: Self = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::RuleStoreUnavailable(format!("corrupt index {}: {}", path.display(), e))
        })?;
        if index.version != INDEX_VERSION {
            return Err(PipelineError::RuleStoreUnavailable(format!(
                "unsupported index version {}",
                index.version
            )));
        }
        Ok(index)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Up to `top_k` documents, most similar first; equal scores keep corpus order
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<ScoredRule> {
        let mut hits: Vec<ScoredRule> = self
            .documents
            .iter()
            .map(|doc| ScoredRule {
                id: doc.id.clone(),
                text: doc.text.clone(),
                score: cosine_similarity(query, &doc.embedding),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);
        hits
    }
}

/// Zero for mismatched lengths and zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Split a rules file into documents.
///
/// Blank-line separated paragraphs when the file has any, otherwise one rule
/// per non-empty line.
pub fn split_rules(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let paragraphs: Vec<String> = normalized
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.lines().map(str::trim).collect::<Vec<_>>().join(" "))
        .collect();

    if paragraphs.len() > 1 {
        return paragraphs;
    }

    normalized
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

//! Rule loading tool
//!
//! Splits the rules text file into documents, embeds each one and writes the
//! vector index the semantic retriever reads.

use anyhow::{bail, Context, Result};
use clap::Parser;
use claim_fraud_pipeline::{
    agent::read_api_key,
    config::{AppConfig, EmbedderKind},
    logging::init_logging,
    retrieval::{build_embedder, split_rules, Embedder, RuleIndex},
};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "load-rules", about = "Embed fraud rules into the vector index")]
struct Cli {
    #[arg(long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Override `retrieval.rules_file`
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Override `retrieval.index_path`
    #[arg(long)]
    index: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from_path(&cli.config)?;
    init_logging(&config.logging)?;

    let rules_path = cli
        .rules
        .unwrap_or_else(|| PathBuf::from(&config.retrieval.rules_file));
    let index_path = cli
        .index
        .unwrap_or_else(|| PathBuf::from(&config.retrieval.index_path));

    let text = std::fs::read_to_string(&rules_path)
        .with_context(|| format!("reading {}", rules_path.display()))?;
    let rules = split_rules(&text);
    if rules.is_empty() {
        bail!("{} contains no rules", rules_path.display());
    }

    let api_key = match config.retrieval.embedder {
        EmbedderKind::OpenAi => Some(read_api_key(&config.agent.api_key_env)?),
        EmbedderKind::Local => None,
    };
    let embedder = build_embedder(&config.retrieval, &config.agent.endpoint, api_key.as_deref())?;
    info!(
        rules = rules.len(),
        provider = embedder.provider_name(),
        model = embedder.model_name(),
        "Embedding rules"
    );

    let index = RuleIndex::build(&rules, embedder.as_ref()).await?;
    index
        .save(&index_path)
        .with_context(|| format!("writing {}", index_path.display()))?;

    info!(
        path = %index_path.display(),
        documents = index.len(),
        dimensions = index.dimensions,
        "Rule index saved"
    );
    Ok(())
}

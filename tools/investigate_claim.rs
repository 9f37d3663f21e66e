//! Investigate a single claim read from a JSON file and print the report.

use anyhow::{Context, Result};
use clap::Parser;
use claim_fraud_pipeline::{
    config::AppConfig, logging::init_logging, Claim, InvestigationAgent,
};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "investigate-claim", about = "Run one claim through the investigation agent")]
struct Cli {
    /// JSON file holding one claim object
    claim: PathBuf,

    #[arg(long, default_value = "config/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from_path(&cli.config)?;
    init_logging(&config.logging)?;

    let raw = std::fs::read_to_string(&cli.claim)
        .with_context(|| format!("reading {}", cli.claim.display()))?;
    let claim: Claim = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a claim object", cli.claim.display()))?;

    let agent = InvestigationAgent::from_config(&config)?;
    let report = agent.investigate_or_unavailable(&claim).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

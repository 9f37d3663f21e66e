//! Offline training tool
//!
//! `inspect` summarizes the raw claims dataset; `train` fits the classifier,
//! writes the schema and tree ensemble into the models directory and logs
//! the run to the experiment store. With the onnx backend the ensemble goes
//! to `models.explainer_file`; the ONNX graph itself is exported separately.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use claim_fraud_pipeline::{config::AppConfig, logging::init_logging, Trainer};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "train-model", about = "Inspect claim data and train the fraud classifier")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Override `training.dataset_path`
    #[arg(long)]
    dataset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print shape, target balance, numeric stats and missing values
    Inspect,
    /// Fit the classifier and persist its artifacts
    Train {
        /// Skip writing the run to the experiment store
        #[arg(long)]
        no_tracking: bool,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load_from_path(&cli.config)?;
    init_logging(&config.logging)?;
    if let Some(dataset) = &cli.dataset {
        config.training.dataset_path = dataset.display().to_string();
    }

    let trainer = Trainer::new(config.training.clone());
    let dataset = trainer
        .load_dataset()
        .with_context(|| format!("loading {}", config.training.dataset_path))?;

    match cli.command {
        Command::Inspect => {
            let summary = dataset.inspect(&config.training.target, &config.training.numeric_features)?;
            println!("{}", summary);
        }
        Command::Train { no_tracking } => {
            let Some(ensemble_file) = config.models.ensemble_file() else {
                bail!(
                    "models.backend is onnx and models.explainer_file does not name a separate file; \
                     refusing to overwrite {} with a tree ensemble",
                    config.models.model_file
                );
            };

            let outcome = trainer.fit(&dataset)?;
            println!("{}", outcome.report);

            let saved = trainer.persist(
                &outcome,
                Path::new(&config.models.models_dir),
                ensemble_file,
                &config.models.schema_file,
            )?;
            info!(
                model = %saved.model_path.display(),
                schema = %saved.schema_path.display(),
                "Training complete"
            );

            if !no_tracking {
                let run = trainer.track(&outcome)?;
                info!(run_id = %run.run_id, experiment = %run.experiment, "Run logged");
            }
        }
    }

    Ok(())
}

//! Claim Fraud Investigation Pipeline - Main Entry Point
//!
//! Consumes claims from NATS, scores and investigates each one, and publishes
//! an investigation report per claim. Claims are processed in parallel by a
//! bounded worker pool.

use anyhow::Result;
use claim_fraud_pipeline::{
    config::AppConfig,
    consumer::ClaimConsumer,
    logging::init_logging,
    metrics::{MetricsReporter, PipelineMetrics},
    producer::ReportProducer,
    InvestigationAgent, InvestigationReport,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_logging(&config.logging)?;

    info!("Starting Claim Fraud Investigation Pipeline");
    info!(
        backend = ?config.models.backend,
        explainability = ?config.models.explainability,
        retrieval = ?config.retrieval.strategy,
        output_mode = ?config.agent.output_mode,
        model = %config.agent.model,
        "Configuration loaded"
    );

    let metrics = Arc::new(PipelineMetrics::new());

    // Credentials, artifacts and the rule store are all checked before connecting
    let agent = Arc::new(InvestigationAgent::from_config(&config)?.with_metrics(metrics.clone()));

    let client = async_nats::connect(&config.nats.url).await?;
    info!("Connected to NATS at {}", config.nats.url);

    let consumer = ClaimConsumer::new(client.clone(), &config.nats.claim_subject);
    let producer = Arc::new(ReportProducer::new(client.clone(), &config.nats.report_subject));

    let num_workers = config.pipeline.workers.max(1);
    info!(
        workers = num_workers,
        claims = consumer.subject(),
        reports = producer.subject(),
        "Starting claim processing loop"
    );

    // Semaphore to limit concurrent investigations
    let semaphore = Arc::new(Semaphore::new(num_workers));

    let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.metrics_interval_secs);
    tokio::spawn(reporter.start());

    let mut subscription = consumer.subscribe().await?;

    while let Some(message) = subscription.next().await {
        let permit = semaphore.clone().acquire_owned().await?;

        let agent = agent.clone();
        let producer = producer.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let start_time = Instant::now();

            let report = match ClaimConsumer::decode(&message.payload) {
                Ok(claim) => agent.investigate_or_unavailable(&claim).await,
                Err(e) => {
                    error!(error = %e, "Failed to decode claim");
                    InvestigationReport::unavailable(
                        uuid::Uuid::new_v4().to_string(),
                        e.kind(),
                        e.to_string(),
                    )
                }
            };

            let processing_time = start_time.elapsed();
            metrics.record_investigation(processing_time, report.error_kind.as_deref());

            match producer.publish(&report).await {
                Ok(()) => info!(
                    claim_id = %report.claim_id,
                    status = ?report.status,
                    risk_level = report.prediction.as_ref().map(|p| p.risk_level.as_str()),
                    processing_time_ms = processing_time.as_millis() as u64,
                    "Investigation report published"
                ),
                Err(e) => error!(
                    claim_id = %report.claim_id,
                    error = %e,
                    "Failed to publish investigation report"
                ),
            }

            drop(permit);
        });
    }

    info!("Pipeline shutting down...");
    metrics.print_summary();

    Ok(())
}

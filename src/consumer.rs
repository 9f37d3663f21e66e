//! NATS message consumer for incoming claims

use crate::error::{PipelineError, PipelineResult};
use crate::types::claim::Claim;
use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::info;

/// Consumer for receiving claims from NATS
pub struct ClaimConsumer {
    client: Client,
    subject: String,
}

impl ClaimConsumer {
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Subscribe to the claim subject
    pub async fn subscribe(&self) -> Result<Subscriber> {
        let subscriber = self.client.subscribe(self.subject.clone()).await?;
        info!(subject = %self.subject, "Subscribed to claim subject");
        Ok(subscriber)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Decode a message payload; claims must be JSON objects
    pub fn decode(payload: &[u8]) -> PipelineResult<Claim> {
        serde_json::from_slice(payload)
            .map_err(|e| PipelineError::SchemaMismatch(format!("claim payload is not a JSON object: {}", e)))
    }
}

//! Training Submission Gateway
//!
//! Approved batches leave the process through [`TrainingGateway::submit`].
//! [`DedupGateway`] guarantees at most one acknowledged submission per
//! batch id; a failed attempt is not cached and may be retried.

use crate::errors::{McpError, McpResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAck {
    pub batch_id: String,
    pub submission_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionRequest<'a> {
    batch_id: &'a str,
    override_ids: &'a [String],
}

#[async_trait]
pub trait TrainingGateway: Send + Sync {
    async fn submit(&self, batch_id: &str, override_ids: &[String]) -> McpResult<SubmissionAck>;
}

/// Forwards batches to the retraining service. The batch id doubles as the
/// idempotency key on the wire.
pub struct HttpTrainingGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTrainingGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> McpResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| McpError::network("build training gateway client", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TrainingGateway for HttpTrainingGateway {
    async fn submit(&self, batch_id: &str, override_ids: &[String]) -> McpResult<SubmissionAck> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", batch_id)
            .json(&SubmissionRequest { batch_id, override_ids })
            .send()
            .await
            .map_err(|e| McpError::network("training submission", e))?;

        if !response.status().is_success() {
            return Err(McpError::gateway(
                "submit",
                format!("retraining service returned {}", response.status()),
            ));
        }

        response
            .json::<SubmissionAck>()
            .await
            .map_err(|e| McpError::network("training submission response", e))
    }
}

/// Acknowledges locally when no retraining endpoint is configured.
#[derive(Debug, Default)]
pub struct LocalAckGateway;

#[async_trait]
impl TrainingGateway for LocalAckGateway {
    async fn submit(&self, batch_id: &str, override_ids: &[String]) -> McpResult<SubmissionAck> {
        info!(
            "No training endpoint configured; batch {} ({} overrides) acknowledged locally",
            batch_id,
            override_ids.len()
        );
        Ok(SubmissionAck {
            batch_id: batch_id.to_string(),
            submission_id: format!("local-{}", Uuid::new_v4()),
            accepted_at: Utc::now(),
        })
    }
}

pub struct DedupGateway {
    inner: Arc<dyn TrainingGateway>,
    acks: Mutex<HashMap<String, SubmissionAck>>,
}

impl DedupGateway {
    pub fn new(inner: Arc<dyn TrainingGateway>) -> Self {
        Self {
            inner,
            acks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acknowledged(&self, batch_id: &str) -> Option<SubmissionAck> {
        self.acks.lock().await.get(batch_id).cloned()
    }
}

#[async_trait]
impl TrainingGateway for DedupGateway {
    async fn submit(&self, batch_id: &str, override_ids: &[String]) -> McpResult<SubmissionAck> {
        // held across the inner call: one submission in flight at a time
        let mut acks = self.acks.lock().await;
        if let Some(ack) = acks.get(batch_id) {
            return Ok(ack.clone());
        }
        match self.inner.submit(batch_id, override_ids).await {
            Ok(ack) => {
                acks.insert(batch_id.to_string(), ack.clone());
                Ok(ack)
            }
            Err(e) => {
                warn!("Training submission for batch {} failed: {}", batch_id, e);
                Err(e)
            }
        }
    }
}

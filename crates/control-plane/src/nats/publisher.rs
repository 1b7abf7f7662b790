//! Run status notifications over NATS JetStream.
//!
//! The run worker publishes a small message every time a run changes
//! status. Subscribers fetch details from `GET /workflows/{id}`.

use async_nats::jetstream::{self, Context};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::{RunStatus, WorkflowRun};

/// Default NATS subject for run notifications.
pub const DEFAULT_SUBJECT: &str = "funnelflow.runs";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "funnelflow_runs";

#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),
}

/// Message published on every run status change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunNotification {
    pub run_id: i64,
    pub sequence_id: i64,
    pub status: RunStatus,
    pub attempt: i32,
}

impl From<&WorkflowRun> for RunNotification {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id,
            sequence_id: run.sequence_id,
            status: run.status,
            attempt: run.attempt,
        }
    }
}

/// JetStream publisher for run notifications. Optional: the server runs
/// without NATS.
#[derive(Clone)]
pub struct RunPublisher {
    js: Context,
    subject: String,
}

impl RunPublisher {
    /// Connect to `url` and make sure the stream exists.
    pub async fn connect(url: &str) -> Result<Self, NatsError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| NatsError::Connection(e.to_string()))?;
        Self::new(client, None, None).await
    }

    pub async fn new(
        client: async_nats::Client,
        subject: Option<&str>,
        stream_name: Option<&str>,
    ) -> Result<Self, NatsError> {
        let subject = subject.unwrap_or(DEFAULT_SUBJECT).to_string();
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);

        let js = jetstream::new(client);
        Self::ensure_stream(&js, stream, &subject).await?;

        Ok(Self { js, subject })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: std::time::Duration::from_secs(24 * 3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    pub async fn publish(&self, notification: RunNotification) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(
            run_id = notification.run_id,
            status = %notification.status,
            attempt = notification.attempt,
            "Published run notification"
        );

        Ok(())
    }
}

//! SQS Queue integration for async job processing
//!
//! Provides:
//! - The `MessageQueue` contract used by the dispatcher and pipeline
//! - SQS client wrapper with retry on publish
//! - A transport-neutral `QueueMessage`

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use backoff::{future::retry, ExponentialBackoff};
use std::time::Duration;
use tracing::{debug, warn};

/// A received message, detached from the SQS SDK types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// Queue operations the ingestion service relies on
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Long-poll for the next batch of messages
    async fn receive(&self) -> Result<Vec<QueueMessage>>;

    /// Publish a raw body, returning the new message id
    async fn send_body(&self, body: &str) -> Result<String>;

    /// Delete a message after processing
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Reset a message's visibility timeout
    async fn change_visibility(&self, receipt_handle: &str, seconds: i32) -> Result<()>;
}

/// SQS Queue client wrapper
pub struct Queue {
    client: SqsClient,
    url: String,
    max_messages: i32,
    visibility_timeout: i32,
    wait_time_seconds: i32,
}

impl Queue {
    /// Create a queue client from a shared AWS config
    pub fn new(sdk_config: &aws_types::SdkConfig, config: &QueueConfig) -> Self {
        Self::with_client(SqsClient::new(sdk_config), config)
    }

    /// Create with an existing SQS client
    pub fn with_client(client: SqsClient, config: &QueueConfig) -> Self {
        Self {
            client,
            url: config.url.clone(),
            max_messages: config.batch_size,
            visibility_timeout: config.visibility_timeout_secs,
            wait_time_seconds: config.wait_time_secs,
        }
    }

    fn publish_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }
}

fn into_queue_message(message: Message) -> Option<QueueMessage> {
    let message_id = message.message_id.unwrap_or_default();
    let Some(receipt_handle) = message.receipt_handle else {
        warn!(message_id = %message_id, "Received message without receipt handle, skipping");
        return None;
    };
    Some(QueueMessage {
        message_id,
        receipt_handle,
        body: message.body.unwrap_or_default(),
    })
}

#[async_trait]
impl MessageQueue for Queue {
    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(self.max_messages)
            .visibility_timeout(self.visibility_timeout)
            .wait_time_seconds(self.wait_time_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages: Vec<QueueMessage> = result
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(into_queue_message)
            .collect();
        debug!(count = messages.len(), "Received messages from queue");

        Ok(messages)
    }

    async fn send_body(&self, body: &str) -> Result<String> {
        let client = &self.client;
        let url = self.url.as_str();
        let result = retry(Self::publish_backoff(), || async move {
            client
                .send_message()
                .queue_url(url)
                .message_body(body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "Send attempt failed");
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(|e| AppError::QueueError {
            message: format!("Failed to send message: {}", e),
        })?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, "Message sent to queue");

        Ok(message_id)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: i32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to change visibility: {}", e),
            })?;

        debug!(seconds, "Changed message visibility");
        Ok(())
    }
}

//! Durable job queue contract.
//!
//! Delivery is at-least-once: an acknowledged message is never delivered again, while a
//! message whose delivery is dropped unsettled (consumer crash, lost channel) comes back to
//! some consumer. Nothing is ordered across consumers. Workers therefore treat the payload as
//! the only source of truth for `job_id` and never assume they see a message once.

pub mod amqp;
pub mod memory;

use crate::storage::BlobLocation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;

/// Message published for every accepted upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Identifier of the ingestion job.
    pub job_id: String,
    /// Content-derived identifier of the uploaded document.
    pub document_id: String,
    /// Where the uploaded bytes live.
    pub blob_location: BlobLocation,
    /// MIME type declared at upload.
    pub content_type: String,
    /// Size of the stored blob.
    pub size_bytes: u64,
    /// Processing attempts already spent on this job.
    pub attempt_count: u32,
    /// When this copy of the message was enqueued, as integer Unix seconds on the wire.
    #[serde(with = "time::serde::timestamp")]
    pub enqueued_at: OffsetDateTime,
}

impl JobMessage {
    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::Encode)
    }

    /// Parse a wire payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Copy of this message for the next attempt.
    pub fn for_retry(&self, attempt_count: u32) -> Self {
        Self {
            attempt_count,
            enqueued_at: OffsetDateTime::now_utc(),
            ..self.clone()
        }
    }
}

/// Record published to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Job identifier, when the payload could be parsed.
    pub job_id: Option<String>,
    /// Original message, or the raw payload as a string when it was malformed.
    pub payload: serde_json::Value,
    /// Summary of the failure that exhausted the job.
    pub error: String,
    /// Attempts spent before giving up.
    pub attempts: u32,
    /// When the job was dead-lettered.
    #[serde(with = "time::serde::rfc3339")]
    pub dead_lettered_at: OffsetDateTime,
}

impl DeadLetter {
    /// Dead letter for a well-formed job message.
    pub fn for_job(message: &JobMessage, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            job_id: Some(message.job_id.clone()),
            payload: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
            error: error.into(),
            attempts,
            dead_lettered_at: OffsetDateTime::now_utc(),
        }
    }

    /// Dead letter for a payload that could not be decoded.
    pub fn for_malformed(payload: &[u8], error: impl Into<String>) -> Self {
        Self {
            job_id: None,
            payload: serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
            error: error.into(),
            attempts: 0,
            dead_lettered_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Errors raised by queue implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker connection or channel failed.
    #[error("broker unavailable: {0}")]
    Broker(String),
    /// The broker refused a publish.
    #[error("publish was not confirmed by the broker")]
    NotConfirmed,
    /// The queue has been closed.
    #[error("queue is closed")]
    Closed,
    /// The delivery was already acknowledged or requeued.
    #[error("delivery already settled")]
    AlreadySettled,
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Producer side of the durable job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a job message durably. Returns once the broker has accepted it.
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError>;

    /// Publish to the dead-letter destination.
    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), QueueError>;

    /// Open a consumer that holds at most `prefetch` unsettled deliveries.
    async fn consumer(&self, prefetch: u16) -> Result<Box<dyn JobConsumer>, QueueError>;

    /// Release broker resources. Pending consumers observe end of stream.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Consumer handle owned by a single worker.
#[async_trait]
pub trait JobConsumer: Send {
    /// Wait for the next delivery. `None` means the queue was closed.
    async fn next_delivery(&mut self) -> Result<Option<Box<dyn Delivery>>, QueueError>;
}

/// One in-flight delivery. Dropping it unsettled returns the message to the queue.
#[async_trait]
pub trait Delivery: Send {
    /// Raw message body.
    fn payload(&self) -> &[u8];

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledge: the message is never delivered again.
    async fn ack(&mut self) -> Result<(), QueueError>;

    /// Replace the message with `updated` for a later attempt and settle this delivery.
    async fn requeue(&mut self, updated: &JobMessage) -> Result<(), QueueError>;
}

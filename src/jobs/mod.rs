//! Ingestion job records.
//!
//! Ingress creates one record per accepted upload before publishing; the worker holding a
//! delivery is the only writer afterwards. Records are never deleted once their message has
//! been published, and terminal records stay for audit.

pub mod sqlite;
pub mod status;

use crate::queue::JobMessage;
use crate::storage::BlobLocation;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

pub use sqlite::SqliteJobStore;
pub use status::{JobStatus, ParseStatusError, Stage};

/// Persistent view of one ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionJob {
    /// Identifier generated at publish time.
    pub job_id: String,
    /// Content-derived document identifier.
    pub document_id: String,
    /// Uploaded blob.
    pub blob_location: BlobLocation,
    /// Declared MIME type.
    pub content_type: String,
    /// Stored size of the blob.
    pub size_bytes: u64,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last modification time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Summary of the most recent failure.
    pub last_error: Option<String>,
}

impl IngestionJob {
    /// New `Pending` record for a freshly stored upload.
    pub fn pending(
        job_id: String,
        document_id: String,
        blob_location: BlobLocation,
        content_type: String,
        size_bytes: u64,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            job_id,
            document_id,
            blob_location,
            content_type,
            size_bytes,
            status: JobStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Rebuild a record from a delivered message when the store has no row for it.
    pub fn from_message(message: &JobMessage) -> Self {
        let mut job = Self::pending(
            message.job_id.clone(),
            message.document_id.clone(),
            message.blob_location.clone(),
            message.content_type.clone(),
            message.size_bytes,
        );
        job.attempt_count = message.attempt_count;
        job
    }

    /// Move to `next`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobStoreError> {
        if !self.status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

/// Errors raised by job stores.
#[derive(Debug, Error)]
pub enum JobStoreError {
    /// The underlying database failed.
    #[error("job store unavailable: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored row could not be decoded.
    #[error("corrupt job record {job_id}: {reason}")]
    Corrupt {
        /// Offending job.
        job_id: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The requested transition is not allowed.
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job being updated.
        job_id: String,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
}

/// Storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert the record unless one with the same `job_id` exists.
    async fn create(&self, job: &IngestionJob) -> Result<(), JobStoreError>;

    /// Fetch a record.
    async fn get(&self, job_id: &str) -> Result<Option<IngestionJob>, JobStoreError>;

    /// Insert or replace a record. A stored `Indexed` or `DeadLettered` record is left as is.
    async fn save(&self, job: &IngestionJob) -> Result<(), JobStoreError>;

    /// Remove a record whose message was never published. Only `Pending` rows are removed.
    async fn discard(&self, job_id: &str) -> Result<(), JobStoreError>;

    /// Whether any job references the blob.
    async fn has_job_for_blob(&self, location: &BlobLocation) -> Result<bool, JobStoreError>;
}

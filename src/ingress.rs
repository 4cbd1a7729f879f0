//! Upload orchestration.
//!
//! An upload is authenticated, validated, streamed into the blob store while its SHA-256 is
//! computed, recorded as a `Pending` job and published. The caller gets identifiers back only
//! once the job message is on the queue. If publishing fails the job record is discarded and
//! the error is returned; the already-written blob is left for the orphan sweep.

use crate::auth::CredentialAuthority;
use crate::error::{PipelineError, with_timeout};
use crate::extraction;
use crate::jobs::{IngestionJob, JobStore};
use crate::metrics::PipelineMetrics;
use crate::queue::{JobMessage, JobQueue};
use crate::storage::{BlobLocation, BlobStore, ByteStream, object_key};
use async_stream::try_stream;
use futures_util::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Ingress tunables.
#[derive(Debug, Clone)]
pub struct IngressSettings {
    /// Bucket receiving uploads.
    pub bucket: String,
    /// Largest accepted upload.
    pub max_upload_bytes: u64,
    /// Deadline for each external call.
    pub call_timeout: Duration,
}

/// A document upload as received from the transport.
pub struct UploadRequest {
    /// Client-supplied file name.
    pub file_name: String,
    /// Declared MIME type.
    pub content_type: String,
    /// Declared size in bytes; the stream must match it exactly.
    pub size: u64,
    /// Document bytes.
    pub body: ByteStream,
}

/// Identifiers returned for an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    /// Fresh job identity.
    pub job_id: String,
    /// Hex SHA-256 of the document bytes.
    pub document_id: String,
}

enum StreamOutcome {
    Complete(String),
    SizeMismatch { declared: u64, received: u64 },
}

/// Accepts uploads and hands them to the worker pool through the queue.
pub struct IngressService {
    authority: Arc<CredentialAuthority>,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<PipelineMetrics>,
    settings: IngressSettings,
}

impl IngressService {
    /// Wire the service to its collaborators.
    pub fn new(
        authority: Arc<CredentialAuthority>,
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<PipelineMetrics>,
        settings: IngressSettings,
    ) -> Self {
        Self {
            authority,
            blobs,
            jobs,
            queue,
            metrics,
            settings,
        }
    }

    /// Largest accepted upload, for transports that enforce it early.
    pub fn max_upload_bytes(&self) -> u64 {
        self.settings.max_upload_bytes
    }

    /// Store, record and publish one document.
    pub async fn upload(
        &self,
        token: &str,
        request: UploadRequest,
    ) -> Result<UploadReceipt, PipelineError> {
        let result = self.accept(token, request).await;
        match &result {
            Ok(_) => self.metrics.record_upload_accepted(),
            Err(_) => self.metrics.record_upload_rejected(),
        }
        result
    }

    async fn accept(
        &self,
        token: &str,
        request: UploadRequest,
    ) -> Result<UploadReceipt, PipelineError> {
        let user_id = self.authority.validate_token(token).map_err(|err| {
            tracing::info!(kind = err.kind(), "Upload rejected: bad credential");
            PipelineError::Auth(err)
        })?;
        self.validate(&request)?;

        let UploadRequest {
            file_name,
            content_type,
            size,
            body,
        } = request;
        let location = BlobLocation::new(
            self.settings.bucket.clone(),
            object_key(&file_name, OffsetDateTime::now_utc()),
        );
        tracing::debug!(user_id = %user_id, %location, size, content_type = %content_type, "Streaming upload");

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let hashed = hashing_stream(body, size, outcome_tx);
        let stored = with_timeout(
            "blob upload",
            self.settings.call_timeout,
            self.blobs.put(&location, hashed, size, &content_type),
        )
        .await;

        let document_id = match (stored, outcome_rx.await) {
            (_, Ok(StreamOutcome::SizeMismatch { declared, received })) => {
                return Err(PipelineError::Validation(format!(
                    "declared size {declared} does not match {received} bytes received"
                )));
            }
            (Err(err), _) => return Err(err),
            (Ok(()), Ok(StreamOutcome::Complete(digest))) => digest,
            (Ok(()), Err(_)) => {
                return Err(PipelineError::TransientDependency(
                    "blob store finished without consuming the upload".into(),
                ));
            }
        };

        let job = IngestionJob::pending(
            Uuid::new_v4().to_string(),
            document_id,
            location,
            content_type,
            size,
        );
        with_timeout(
            "job record insert",
            self.settings.call_timeout,
            self.jobs.create(&job),
        )
        .await?;

        let message = JobMessage {
            job_id: job.job_id.clone(),
            document_id: job.document_id.clone(),
            blob_location: job.blob_location.clone(),
            content_type: job.content_type.clone(),
            size_bytes: job.size_bytes,
            attempt_count: 0,
            enqueued_at: OffsetDateTime::now_utc(),
        };
        if let Err(err) = with_timeout(
            "job publish",
            self.settings.call_timeout,
            self.queue.publish(&message),
        )
        .await
        {
            tracing::error!(
                job_id = %job.job_id,
                blob = %job.blob_location,
                error = %err,
                "Publish failed; discarding job record"
            );
            if let Err(discard_err) = self.jobs.discard(&job.job_id).await {
                tracing::warn!(job_id = %job.job_id, error = %discard_err, "Failed to discard unpublished job");
            }
            return Err(PipelineError::TransientDependency(format!(
                "job could not be queued: {err}"
            )));
        }

        tracing::info!(
            job_id = %job.job_id,
            document_id = %job.document_id,
            size,
            "Upload accepted"
        );
        Ok(UploadReceipt {
            job_id: job.job_id,
            document_id: job.document_id,
        })
    }

    fn validate(&self, request: &UploadRequest) -> Result<(), PipelineError> {
        if request.file_name.trim().is_empty() {
            return Err(PipelineError::Validation("file name is required".into()));
        }
        if request.size == 0 {
            return Err(PipelineError::Validation("upload is empty".into()));
        }
        if request.size > self.settings.max_upload_bytes {
            return Err(PipelineError::Validation(format!(
                "upload of {} bytes exceeds the {} byte limit",
                request.size, self.settings.max_upload_bytes
            )));
        }
        if !extraction::is_supported(&request.content_type) {
            return Err(PipelineError::Validation(format!(
                "unsupported content type '{}'",
                request.content_type
            )));
        }
        Ok(())
    }
}

/// Pass `body` through while hashing it, failing the stream if it runs past `declared` bytes
/// or ends short. The digest (or the mismatch) is reported on `outcome`.
fn hashing_stream(
    mut body: ByteStream,
    declared: u64,
    outcome: oneshot::Sender<StreamOutcome>,
) -> ByteStream {
    Box::pin(try_stream! {
        let mut hasher = Sha256::new();
        let mut received = 0_u64;
        let mut outcome = Some(outcome);

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > declared {
                if let Some(tx) = outcome.take() {
                    let _ = tx.send(StreamOutcome::SizeMismatch { declared, received });
                }
                Err::<(), _>(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "upload exceeds declared size",
                ))?;
            }
            hasher.update(&chunk);
            yield chunk;
        }

        if let Some(tx) = outcome.take() {
            let result = if received == declared {
                StreamOutcome::Complete(hex::encode(hasher.finalize()))
            } else {
                StreamOutcome::SizeMismatch { declared, received }
            };
            let _ = tx.send(result);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SqliteUserStore, TokenSigner};
    use crate::db;
    use crate::jobs::{JobStatus, SqliteJobStore};
    use crate::queue::MemoryQueue;
    use crate::storage::{MemoryBlobStore, bytes_stream};
    use bytes::Bytes;

    struct Fixture {
        service: IngressService,
        blobs: Arc<MemoryBlobStore>,
        jobs: Arc<SqliteJobStore>,
        queue: MemoryQueue,
        token: String,
    }

    async fn fixture() -> Fixture {
        let pool = db::connect_in_memory().await.expect("pool");
        let authority = Arc::new(CredentialAuthority::new(
            Arc::new(SqliteUserStore::new(pool.clone())),
            TokenSigner::new(b"secret", time::Duration::hours(1)),
            4,
        ));
        authority.register("ada", "analytical").await.expect("register");
        let token = authority
            .issue_token("ada", "analytical")
            .await
            .expect("login")
            .token;
        let blobs = Arc::new(MemoryBlobStore::new());
        let jobs = Arc::new(SqliteJobStore::new(pool));
        let queue = MemoryQueue::new();
        let service = IngressService::new(
            authority,
            blobs.clone(),
            jobs.clone(),
            Arc::new(queue.clone()),
            Arc::new(PipelineMetrics::new()),
            IngressSettings {
                bucket: "docs".into(),
                max_upload_bytes: 64,
                call_timeout: Duration::from_secs(5),
            },
        );
        Fixture {
            service,
            blobs,
            jobs,
            queue,
            token,
        }
    }

    fn request(body: &'static str, size: u64) -> UploadRequest {
        UploadRequest {
            file_name: "notes.txt".into(),
            content_type: "text/plain".into(),
            size,
            body: bytes_stream(Bytes::from_static(body.as_bytes())),
        }
    }

    #[tokio::test]
    async fn accepted_upload_is_stored_recorded_and_published() {
        let f = fixture().await;
        let receipt = f
            .service
            .upload(&f.token, request("hello world", 11))
            .await
            .expect("upload");

        assert_eq!(
            receipt.document_id,
            hex::encode(Sha256::digest(b"hello world"))
        );
        assert_ne!(receipt.job_id, receipt.document_id);
        let job = f.jobs.get(&receipt.job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(f.blobs.object_count(), 1);
        assert_eq!(f.queue.published_count(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_any_write() {
        let f = fixture().await;
        let cases = [
            request("", 0),
            request("x", 65),
            UploadRequest {
                content_type: "image/png".into(),
                ..request("png", 3)
            },
            UploadRequest {
                file_name: " ".into(),
                ..request("abc", 3)
            },
        ];
        for case in cases {
            let err = f.service.upload(&f.token, case).await.expect_err("rejected");
            assert!(matches!(err, PipelineError::Validation(_)), "{err}");
        }
        assert_eq!(f.blobs.write_count(), 0);
        assert_eq!(f.queue.published_count(), 0);
    }

    #[tokio::test]
    async fn size_mismatch_is_a_validation_error() {
        let f = fixture().await;
        for declared in [5, 20] {
            let err = f
                .service
                .upload(&f.token, request("hello world", declared))
                .await
                .expect_err("mismatch");
            assert!(matches!(err, PipelineError::Validation(_)), "{err}");
        }
        assert_eq!(f.queue.published_count(), 0);
    }

    #[tokio::test]
    async fn bad_token_writes_nothing() {
        let f = fixture().await;
        let err = f
            .service
            .upload("not-a-token", request("hello", 5))
            .await
            .expect_err("rejected");
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(f.blobs.write_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_discards_job_and_reports_transient() {
        let f = fixture().await;
        f.queue.fail_next_publishes(1);
        let err = f
            .service
            .upload(&f.token, request("hello", 5))
            .await
            .expect_err("publish failed");
        assert!(err.is_retryable());
        // Blob remains for the sweep; the record does not.
        assert_eq!(f.blobs.object_count(), 1);
        let location = f.blobs.list("docs").await.expect("list")[0].location.clone();
        assert!(!f.jobs.has_job_for_blob(&location).await.expect("lookup"));
    }
}

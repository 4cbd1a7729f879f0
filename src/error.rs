//! Pipeline-wide error taxonomy.
//!
//! Every component keeps its own `thiserror` enum; the conversions below classify those errors
//! into the four outcomes the rest of the system acts on. Ingress and search map the class to
//! an HTTP status, and the worker retries `TransientDependency` and dead-letters
//! `PermanentProcessing` straight away.

use crate::auth::{AuthError, UserStoreError};
use crate::chunking::ChunkingError;
use crate::config::ConfigError;
use crate::embedding::EmbeddingClientError;
use crate::extraction::ExtractionError;
use crate::index::IndexError;
use crate::jobs::JobStoreError;
use crate::queue::QueueError;
use crate::storage::BlobError;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Classified failure of a pipeline operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request itself is unacceptable. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Credentials or token were rejected. Never retried.
    #[error("authentication failed: {0}")]
    Auth(AuthError),
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A dependency was unavailable or timed out. Retried with backoff.
    #[error("dependency unavailable: {0}")]
    TransientDependency(String),
    /// The input can never be processed. Dead-lettered without retry.
    #[error("processing failed: {0}")]
    PermanentProcessing(String),
}

impl PipelineError {
    /// Whether another attempt may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDependency(_))
    }

    /// Stable machine-readable kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Auth(_) => "auth",
            Self::NotFound(_) => "not_found",
            Self::TransientDependency(_) => "transient_dependency",
            Self::PermanentProcessing(_) => "permanent_processing",
        }
    }

    /// Error for an external call that exceeded its deadline.
    pub fn timeout(operation: &str, limit: Duration) -> Self {
        Self::TransientDependency(format!("{operation} timed out after {}ms", limit.as_millis()))
    }
}

/// Run `future` under `limit`, mapping expiry to [`PipelineError::TransientDependency`].
pub async fn with_timeout<T, E, F>(operation: &str, limit: Duration, future: F) -> Result<T, PipelineError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(PipelineError::timeout(operation, limit)),
    }
}

fn transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

impl From<AuthError> for PipelineError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Hashing(_) | AuthError::Signing(_) => {
                Self::TransientDependency(err.to_string())
            }
            other => Self::Auth(other),
        }
    }
}

impl From<UserStoreError> for PipelineError {
    fn from(err: UserStoreError) -> Self {
        match err {
            UserStoreError::Duplicate(_) => Self::Validation(err.to_string()),
            UserStoreError::Database(_) => Self::TransientDependency(err.to_string()),
        }
    }
}

impl From<BlobError> for PipelineError {
    fn from(err: BlobError) -> Self {
        match &err {
            BlobError::NotFound(_) | BlobError::InvalidEndpoint(_) => {
                Self::PermanentProcessing(err.to_string())
            }
            BlobError::UnexpectedStatus { status, .. } if !transient_status(*status) => {
                Self::PermanentProcessing(err.to_string())
            }
            _ => Self::TransientDependency(err.to_string()),
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Encode(_) => Self::PermanentProcessing(err.to_string()),
            _ => Self::TransientDependency(err.to_string()),
        }
    }
}

impl From<JobStoreError> for PipelineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Database(_) => Self::TransientDependency(err.to_string()),
            _ => Self::PermanentProcessing(err.to_string()),
        }
    }
}

impl From<ExtractionError> for PipelineError {
    fn from(err: ExtractionError) -> Self {
        Self::PermanentProcessing(err.to_string())
    }
}

impl From<ChunkingError> for PipelineError {
    fn from(err: ChunkingError) -> Self {
        Self::PermanentProcessing(err.to_string())
    }
}

impl From<EmbeddingClientError> for PipelineError {
    fn from(err: EmbeddingClientError) -> Self {
        match &err {
            EmbeddingClientError::Unavailable(_) | EmbeddingClientError::Http(_) => {
                Self::TransientDependency(err.to_string())
            }
            _ => Self::PermanentProcessing(err.to_string()),
        }
    }
}

impl From<IndexError> for PipelineError {
    fn from(err: IndexError) -> Self {
        match &err {
            IndexError::Http(_) => Self::TransientDependency(err.to_string()),
            IndexError::UnexpectedStatus { status, .. } if transient_status(*status) => {
                Self::TransientDependency(err.to_string())
            }
            _ => Self::PermanentProcessing(err.to_string()),
        }
    }
}

/// Failure to bring a process up. Returned to `main`, which decides how to exit.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration was missing or invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The database could not be opened or migrated.
    #[error("database unavailable: {0}")]
    Database(#[from] sqlx::Error),
    /// The job broker could not be reached.
    #[error("job broker unavailable: {0}")]
    Broker(#[from] QueueError),
    /// The object store could not be reached or configured.
    #[error("object store unavailable: {0}")]
    BlobStore(#[from] BlobError),
    /// The vector index could not be prepared.
    #[error("vector index unavailable: {0}")]
    Index(#[from] IndexError),
    /// The embedding provider could not be configured.
    #[error("embedding provider unavailable: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// The chunker could not be configured.
    #[error("chunker unavailable: {0}")]
    Chunking(#[from] ChunkingError),
    /// The HTTP listener could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(PipelineError::TransientDependency("x".into()).is_retryable());
        assert!(!PipelineError::PermanentProcessing("x".into()).is_retryable());
        assert!(!PipelineError::Validation("x".into()).is_retryable());
        assert!(!PipelineError::Auth(AuthError::TokenExpired).is_retryable());
    }

    #[test]
    fn index_status_codes_are_classified() {
        let unavailable = IndexError::UnexpectedStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        let rejected = IndexError::UnexpectedStatus {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(PipelineError::from(unavailable).is_retryable());
        assert!(!PipelineError::from(rejected).is_retryable());
    }

    #[test]
    fn missing_blob_is_permanent() {
        let err = PipelineError::from(BlobError::NotFound("docs/x".into()));
        assert!(matches!(err, PipelineError::PermanentProcessing(_)));
    }

    #[tokio::test]
    async fn timeouts_become_transient() {
        let result: Result<(), PipelineError> = with_timeout(
            "slow call",
            Duration::from_millis(5),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), PipelineError>(())
            },
        )
        .await;
        let err = result.expect_err("timed out");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("slow call"));
    }
}

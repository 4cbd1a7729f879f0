//! Facade the HTTP layer talks to.

use crate::auth::{CredentialAuthority, IssuedToken};
use crate::error::PipelineError;
use crate::ingress::{IngressService, UploadReceipt, UploadRequest};
use crate::jobs::{IngestionJob, JobStore};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::query::{QueryService, SearchHit};
use async_trait::async_trait;
use std::sync::Arc;

/// Operations exposed over HTTP.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Register a user.
    async fn signup(&self, user_id: &str, password: &str) -> Result<(), PipelineError>;

    /// Exchange credentials for a bearer token.
    async fn login(&self, user_id: &str, password: &str) -> Result<IssuedToken, PipelineError>;

    /// Check a bearer token and return the user it was issued to.
    async fn authenticate(&self, token: &str) -> Result<String, PipelineError>;

    /// Accept a document for ingestion.
    async fn upload(
        &self,
        token: &str,
        request: UploadRequest,
    ) -> Result<UploadReceipt, PipelineError>;

    /// Search indexed chunks.
    async fn search(
        &self,
        token: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, PipelineError>;

    /// Look up a job record.
    async fn job_status(&self, token: &str, job_id: &str) -> Result<IngestionJob, PipelineError>;

    /// Largest accepted upload.
    fn max_upload_bytes(&self) -> u64;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// [`PipelineApi`] over the real services.
pub struct Pipeline {
    authority: Arc<CredentialAuthority>,
    ingress: IngressService,
    query: QueryService,
    jobs: Arc<dyn JobStore>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// Combine the services behind one facade.
    pub fn new(
        authority: Arc<CredentialAuthority>,
        ingress: IngressService,
        query: QueryService,
        jobs: Arc<dyn JobStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            authority,
            ingress,
            query,
            jobs,
            metrics,
        }
    }
}

#[async_trait]
impl PipelineApi for Pipeline {
    async fn signup(&self, user_id: &str, password: &str) -> Result<(), PipelineError> {
        self.authority.register(user_id, password).await
    }

    async fn login(&self, user_id: &str, password: &str) -> Result<IssuedToken, PipelineError> {
        self.authority.issue_token(user_id, password).await
    }

    async fn authenticate(&self, token: &str) -> Result<String, PipelineError> {
        Ok(self.authority.validate_token(token)?)
    }

    async fn upload(
        &self,
        token: &str,
        request: UploadRequest,
    ) -> Result<UploadReceipt, PipelineError> {
        self.ingress.upload(token, request).await
    }

    async fn search(
        &self,
        token: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        self.query.search(token, query_text, top_k).await
    }

    async fn job_status(&self, token: &str, job_id: &str) -> Result<IngestionJob, PipelineError> {
        self.authority.validate_token(token)?;
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job '{job_id}'")))
    }

    fn max_upload_bytes(&self) -> u64 {
        self.ingress.max_upload_bytes()
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

//! Job worker: the state machine that turns a queued job into indexed chunks.
//!
//! A delivery runs through extract, chunk, embed and index, persisting the job status before
//! each stage so a crash leaves an in-flight status behind and the redelivered message restarts
//! at extraction. Deliveries may arrive more than once; indexed and dead-lettered jobs are
//! acknowledged without work, and every write is an upsert keyed by deterministic chunk ids.
//!
//! The attempt number is `max(message attempts, stored attempts) + 1` and is persisted before
//! any stage runs. A worker that keeps crashing on the same job therefore still exhausts the
//! budget, and the job is dead-lettered without processing once it is spent.

mod pool;
mod retry;

use crate::chunking::{ChunkSpan, Chunker};
use crate::embedding::EmbeddingClient;
use crate::error::{PipelineError, with_timeout};
use crate::extraction::{Extractor, Page};
use crate::index::{ChunkPoint, IndexSummary, VectorIndex};
use crate::jobs::{IngestionJob, JobStatus, JobStore, Stage};
use crate::metrics::PipelineMetrics;
use crate::queue::{DeadLetter, Delivery, JobMessage, JobQueue, QueueError};
use crate::storage::BlobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

pub use pool::WorkerPool;
pub use retry::RetryPolicy;

/// Tunables for job processing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Attempts a job gets before it is dead-lettered.
    pub max_attempts: u32,
    /// Deadline for each external call.
    pub call_timeout: Duration,
    /// Texts per embedding request.
    pub embedding_batch_size: usize,
    /// Delay schedule between attempts.
    pub retry: RetryPolicy,
}

/// Everything a worker needs to process deliveries.
pub struct WorkerContext {
    /// Job broker, for dead letters.
    pub queue: Arc<dyn JobQueue>,
    /// Uploaded documents.
    pub blobs: Arc<dyn BlobStore>,
    /// Job records.
    pub jobs: Arc<dyn JobStore>,
    /// Text extraction.
    pub extractor: Arc<dyn Extractor>,
    /// Chunking.
    pub chunker: Arc<Chunker>,
    /// Embedding provider.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Vector index.
    pub index: Arc<dyn VectorIndex>,
    /// Shared counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Processing tunables.
    pub settings: WorkerSettings,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// All stages completed.
    Indexed {
        /// Chunks written to the index.
        chunks: usize,
    },
    /// The job was already terminal.
    Duplicate,
    /// A transient failure; the job was requeued.
    Retried {
        /// The attempt that failed.
        attempt: u32,
    },
    /// The job was moved to the dead-letter destination.
    DeadLettered,
    /// The payload was not a job message; it was dead-lettered as-is.
    Malformed,
}

struct StageFailure {
    stage: Stage,
    error: PipelineError,
}

impl StageFailure {
    fn at(stage: Stage) -> impl FnOnce(PipelineError) -> Self {
        move |error| Self { stage, error }
    }
}

/// Process one delivery to completion and settle it.
///
/// Returns an error only when the broker itself fails while settling; the delivery is then
/// left unacknowledged and will be redelivered.
pub async fn process_delivery(
    ctx: &WorkerContext,
    mut delivery: Box<dyn Delivery>,
) -> Result<DeliveryOutcome, QueueError> {
    let message = match JobMessage::from_bytes(delivery.payload()) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "Dead-lettering malformed job message");
            ctx.queue
                .publish_dead_letter(&DeadLetter::for_malformed(delivery.payload(), err.to_string()))
                .await?;
            delivery.ack().await?;
            ctx.metrics.record_job_dead_lettered();
            return Ok(DeliveryOutcome::Malformed);
        }
    };

    let span = tracing::info_span!(
        "job",
        job_id = %message.job_id,
        document_id = %message.document_id,
        redelivered = delivery.redelivered(),
    );
    handle_message(ctx, delivery, message).instrument(span).await
}

async fn handle_message(
    ctx: &WorkerContext,
    mut delivery: Box<dyn Delivery>,
    message: JobMessage,
) -> Result<DeliveryOutcome, QueueError> {
    let mut job = match load_job(ctx, &message).await {
        Ok(job) => job,
        Err(err) => {
            // Without the record we cannot track progress; let the broker redeliver.
            tracing::warn!(error = %err, "Job store unavailable; requeueing");
            let attempt = message.attempt_count + 1;
            return retry_or_dead_letter(
                ctx,
                delivery,
                &message,
                None,
                Stage::Extracting,
                err,
                attempt,
            )
            .await;
        }
    };

    if job.status.is_terminal() {
        tracing::info!(status = %job.status, "Skipping duplicate delivery of finished job");
        delivery.ack().await?;
        ctx.metrics.record_duplicate_delivery();
        return Ok(DeliveryOutcome::Duplicate);
    }

    let attempt = message.attempt_count.max(job.attempt_count) + 1;
    if attempt > ctx.settings.max_attempts {
        let stage = job.status.in_flight_stage().unwrap_or(Stage::Extracting);
        let error = PipelineError::PermanentProcessing(format!(
            "attempt budget of {} exhausted",
            ctx.settings.max_attempts
        ));
        tracing::warn!(attempt, status = %job.status, "Attempt budget exhausted before processing");
        return dead_letter(ctx, delivery, &message, Some(job), stage, error, attempt - 1).await;
    }

    if let Some(stage) = job.status.in_flight_stage() {
        tracing::warn!(%stage, "Restarting job interrupted mid-stage");
    }

    match run_stages(ctx, &mut job, attempt).await {
        Ok(summary) => {
            let chunks = summary.inserted + summary.updated;
            delivery.ack().await?;
            ctx.metrics.record_job_indexed(chunks as u64);
            tracing::info!(
                attempt,
                chunks,
                inserted = summary.inserted,
                updated = summary.updated,
                "Job indexed"
            );
            Ok(DeliveryOutcome::Indexed { chunks })
        }
        Err(StageFailure { stage, error }) => {
            retry_or_dead_letter(ctx, delivery, &message, Some(job), stage, error, attempt).await
        }
    }
}

async fn load_job(ctx: &WorkerContext, message: &JobMessage) -> Result<IngestionJob, PipelineError> {
    if let Some(job) = ctx.jobs.get(&message.job_id).await? {
        return Ok(job);
    }
    tracing::warn!("No job record for delivered message; rebuilding it");
    let job = IngestionJob::from_message(message);
    ctx.jobs.create(&job).await?;
    Ok(job)
}

async fn run_stages(
    ctx: &WorkerContext,
    job: &mut IngestionJob,
    attempt: u32,
) -> Result<IndexSummary, StageFailure> {
    job.attempt_count = attempt;
    advance(ctx, job, JobStatus::Extracting)
        .await
        .map_err(StageFailure::at(Stage::Extracting))?;
    tracing::debug!(attempt, "Extracting");
    let pages = extract(ctx, job)
        .await
        .map_err(StageFailure::at(Stage::Extracting))?;

    advance(ctx, job, JobStatus::Chunking)
        .await
        .map_err(StageFailure::at(Stage::Chunking))?;
    let spans = ctx.chunker.chunk_pages(&job.document_id, &pages);
    tracing::debug!(pages = pages.len(), chunks = spans.len(), "Chunked document");
    if spans.is_empty() {
        return Err(StageFailure {
            stage: Stage::Chunking,
            error: PipelineError::PermanentProcessing("document produced no chunks".into()),
        });
    }

    advance(ctx, job, JobStatus::Embedding)
        .await
        .map_err(StageFailure::at(Stage::Embedding))?;
    let vectors = embed(ctx, &spans)
        .await
        .map_err(StageFailure::at(Stage::Embedding))?;

    advance(ctx, job, JobStatus::Indexing)
        .await
        .map_err(StageFailure::at(Stage::Indexing))?;
    let points = spans
        .into_iter()
        .zip(vectors)
        .map(|(span, vector)| ChunkPoint {
            chunk_id: span.chunk_id,
            document_id: job.document_id.clone(),
            sequence_index: span.sequence_index,
            page: span.page,
            text: span.text,
            vector,
        })
        .collect();
    let summary = with_timeout("index upsert", ctx.settings.call_timeout, ctx.index.upsert(points))
        .await
        .map_err(StageFailure::at(Stage::Indexing))?;

    job.last_error = None;
    advance(ctx, job, JobStatus::Indexed)
        .await
        .map_err(StageFailure::at(Stage::Indexing))?;
    Ok(summary)
}

async fn advance(
    ctx: &WorkerContext,
    job: &mut IngestionJob,
    next: JobStatus,
) -> Result<(), PipelineError> {
    // Only adopt the new status once it is stored, so a failed save leaves `job` where the
    // store has it.
    let mut updated = job.clone();
    updated.transition(next)?;
    ctx.jobs.save(&updated).await?;
    *job = updated;
    Ok(())
}

async fn extract(ctx: &WorkerContext, job: &IngestionJob) -> Result<Vec<Page>, PipelineError> {
    let bytes = with_timeout(
        "blob download",
        ctx.settings.call_timeout,
        ctx.blobs.get(&job.blob_location),
    )
    .await?;
    with_timeout(
        "text extraction",
        ctx.settings.call_timeout,
        ctx.extractor.extract(&job.content_type, bytes),
    )
    .await
}

async fn embed(ctx: &WorkerContext, spans: &[ChunkSpan]) -> Result<Vec<Vec<f32>>, PipelineError> {
    let dimension = ctx.embedder.dimension();
    let batch_size = ctx.settings.embedding_batch_size.max(1);
    let mut vectors = Vec::with_capacity(spans.len());
    for batch in spans.chunks(batch_size) {
        let texts = batch.iter().map(|span| span.text.clone()).collect();
        let embedded = with_timeout(
            "embedding request",
            ctx.settings.call_timeout,
            ctx.embedder.generate_embeddings(texts),
        )
        .await?;
        if embedded.len() != batch.len() {
            return Err(PipelineError::PermanentProcessing(format!(
                "embedding provider returned {} vectors for {} chunks",
                embedded.len(),
                batch.len()
            )));
        }
        if let Some(vector) = embedded.iter().find(|vector| vector.len() != dimension) {
            return Err(PipelineError::PermanentProcessing(format!(
                "embedding dimension {} does not match configured {dimension}",
                vector.len()
            )));
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}

async fn retry_or_dead_letter(
    ctx: &WorkerContext,
    mut delivery: Box<dyn Delivery>,
    message: &JobMessage,
    job: Option<IngestionJob>,
    stage: Stage,
    error: PipelineError,
    attempt: u32,
) -> Result<DeliveryOutcome, QueueError> {
    if !error.is_retryable() || attempt >= ctx.settings.max_attempts {
        return dead_letter(ctx, delivery, message, job, stage, error, attempt).await;
    }

    if let Some(mut job) = job {
        mark_failed(ctx, &mut job, stage, &error).await;
    }
    let delay = ctx.settings.retry.backoff_for(attempt);
    tracing::warn!(
        %stage,
        attempt,
        max_attempts = ctx.settings.max_attempts,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Stage failed; retrying after backoff"
    );
    tokio::time::sleep(delay).await;
    delivery.requeue(&message.for_retry(attempt)).await?;
    ctx.metrics.record_job_retried();
    Ok(DeliveryOutcome::Retried { attempt })
}

async fn dead_letter(
    ctx: &WorkerContext,
    mut delivery: Box<dyn Delivery>,
    message: &JobMessage,
    mut job: Option<IngestionJob>,
    stage: Stage,
    error: PipelineError,
    attempts: u32,
) -> Result<DeliveryOutcome, QueueError> {
    tracing::error!(%stage, attempts, error = %error, "Dead-lettering job");
    if let Some(job) = job.as_mut() {
        mark_failed(ctx, job, stage, &error).await;
    }

    // Publish before recording the terminal status so a broker failure leaves the job
    // redeliverable instead of silently finished.
    ctx.queue
        .publish_dead_letter(&DeadLetter::for_job(message, error.to_string(), attempts))
        .await?;

    if let Some(mut job) = job {
        let result = match job.transition(JobStatus::DeadLettered) {
            Ok(()) => ctx.jobs.save(&job).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "Failed to record dead-lettered status");
        }
    }

    delivery.ack().await?;
    ctx.metrics.record_job_dead_lettered();
    Ok(DeliveryOutcome::DeadLettered)
}

async fn mark_failed(ctx: &WorkerContext, job: &mut IngestionJob, stage: Stage, error: &PipelineError) {
    job.last_error = Some(error.to_string());
    if !matches!(job.status, JobStatus::Failed(_))
        && let Err(err) = job.transition(JobStatus::Failed(stage))
    {
        tracing::warn!(error = %err, "Cannot mark job failed");
        return;
    }
    if let Err(err) = ctx.jobs.save(job).await {
        tracing::warn!(error = %err, "Failed to record job failure");
    }
}

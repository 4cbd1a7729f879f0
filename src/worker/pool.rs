use super::{WorkerContext, process_delivery};
use crate::queue::QueueError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const RESTART_DELAY: Duration = Duration::from_secs(1);

/// A fixed number of workers, each with its own consumer, kept alive by a supervisor.
///
/// A worker that panics mid-job, or fails to settle a delivery, is replaced on a fresh
/// consumer; its unsettled delivery goes back to the broker. Cancellation stops workers from taking new deliveries, while a job already in
/// progress runs to completion and is settled.
pub struct WorkerPool {
    supervisor: JoinHandle<()>,
}

impl WorkerPool {
    /// Start `count` workers consuming with the given prefetch.
    pub fn spawn(
        ctx: Arc<WorkerContext>,
        count: usize,
        prefetch: u16,
        cancel: CancellationToken,
    ) -> Self {
        let supervisor = tokio::spawn(supervise(ctx, count.max(1), prefetch, cancel));
        Self { supervisor }
    }

    /// Wait for every worker to stop. Returns once the token is cancelled (or the queue
    /// closes) and in-flight jobs have been settled.
    pub async fn join(self) {
        if let Err(err) = self.supervisor.await {
            tracing::error!(error = %err, "Worker supervisor terminated abnormally");
        }
    }
}

async fn supervise(
    ctx: Arc<WorkerContext>,
    count: usize,
    prefetch: u16,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();
    for worker_id in 0..count {
        workers.spawn(run_worker(worker_id, ctx.clone(), prefetch, cancel.clone()));
    }
    tracing::info!(workers = count, prefetch, "Worker pool started");

    let mut next_id = count;
    while let Some(result) = workers.join_next().await {
        let restart = match result {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Worker lost its consumer");
                true
            }
            Err(err) if err.is_panic() => {
                tracing::error!(error = %err, "Worker panicked");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "Worker task cancelled");
                false
            }
        };

        if restart && !cancel.is_cancelled() {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let worker_id = next_id;
            next_id += 1;
            workers.spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(RESTART_DELAY) => {}
                }
                run_worker(worker_id, ctx, prefetch, cancel).await
            });
        }
    }
    tracing::info!("Worker pool stopped");
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    prefetch: u16,
    cancel: CancellationToken,
) -> Result<(), QueueError> {
    let mut consumer = ctx.queue.consumer(prefetch).await?;
    tracing::debug!(worker_id, "Worker consuming");

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = consumer.next_delivery() => next?,
        };
        let Some(delivery) = next else {
            tracing::debug!(worker_id, "Queue closed");
            break;
        };
        match process_delivery(&ctx, delivery).await {
            Ok(outcome) => tracing::debug!(worker_id, ?outcome, "Delivery settled"),
            Err(err) => {
                tracing::warn!(worker_id, error = %err, "Failed to settle delivery");
                return Err(err);
            }
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunker, ChunkerSettings};
    use crate::db;
    use crate::embedding::HashingEmbedder;
    use crate::extraction::DefaultExtractor;
    use crate::index::{MemoryIndex, VectorIndex};
    use crate::jobs::{IngestionJob, JobStatus, JobStore, SqliteJobStore};
    use crate::metrics::PipelineMetrics;
    use crate::queue::{JobMessage, JobQueue, MemoryQueue};
    use crate::storage::{BlobLocation, BlobStore, MemoryBlobStore, bytes_stream};
    use crate::worker::{RetryPolicy, WorkerSettings};
    use time::OffsetDateTime;

    fn context(
        queue: MemoryQueue,
        jobs: Arc<SqliteJobStore>,
        blobs: Arc<MemoryBlobStore>,
        index: Arc<MemoryIndex>,
    ) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            queue: Arc::new(queue),
            blobs,
            jobs,
            extractor: Arc::new(DefaultExtractor::new()),
            chunker: Arc::new(
                Chunker::new(&ChunkerSettings {
                    chunk_size: 8,
                    overlap: 0,
                    tokenizer_model: "whitespace".into(),
                })
                .expect("chunker"),
            ),
            embedder: Arc::new(HashingEmbedder::new(16).expect("embedder")),
            index,
            metrics: Arc::new(PipelineMetrics::new()),
            settings: WorkerSettings {
                max_attempts: 3,
                call_timeout: Duration::from_secs(5),
                embedding_batch_size: 8,
                retry: RetryPolicy {
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(1),
                },
            },
        })
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_cancel() {
        let queue = MemoryQueue::new();
        let blobs = Arc::new(MemoryBlobStore::new());
        let jobs = Arc::new(SqliteJobStore::new(db::connect_in_memory().await.expect("pool")));
        let index = Arc::new(MemoryIndex::new());
        index.ensure_ready(16).await.expect("ready");

        for n in 0..4 {
            let location = BlobLocation::new("docs", format!("{n}.txt"));
            let text = format!("document number {n}");
            blobs
                .put(&location, bytes_stream(text.clone()), text.len() as u64, "text/plain")
                .await
                .expect("put");
            let job = IngestionJob::pending(
                format!("job-{n}"),
                format!("doc-{n}"),
                location.clone(),
                "text/plain".into(),
                text.len() as u64,
            );
            jobs.create(&job).await.expect("create");
            queue
                .publish(&JobMessage {
                    job_id: job.job_id.clone(),
                    document_id: job.document_id.clone(),
                    blob_location: location,
                    content_type: "text/plain".into(),
                    size_bytes: text.len() as u64,
                    attempt_count: 0,
                    enqueued_at: OffsetDateTime::now_utc(),
                })
                .await
                .expect("publish");
        }

        let ctx = context(queue.clone(), jobs.clone(), blobs, index);

        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(ctx.clone(), 2, 1, cancel.clone());

        tokio::time::timeout(Duration::from_secs(10), async {
            while ctx.metrics.snapshot().jobs_indexed < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all jobs indexed");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("pool stopped");

        for n in 0..4 {
            let job = jobs.get(&format!("job-{n}")).await.expect("get").expect("job");
            assert_eq!(job.status, JobStatus::Indexed);
        }
    }

    #[tokio::test]
    async fn settle_failure_restarts_worker_and_redelivers() {
        let queue = MemoryQueue::new();
        let jobs = Arc::new(SqliteJobStore::new(db::connect_in_memory().await.expect("pool")));
        let index = Arc::new(MemoryIndex::new());
        index.ensure_ready(16).await.expect("ready");
        let ctx = context(queue.clone(), jobs, Arc::new(MemoryBlobStore::new()), index);

        queue.publish_raw(b"{not json".to_vec());
        queue.fail_next_dead_letters(1);

        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(ctx, 1, 1, cancel.clone());

        tokio::time::timeout(Duration::from_secs(10), async {
            while queue.dead_letters().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dead letter recorded after restart");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("pool stopped");

        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, None);
        assert_eq!(queue.depth(), 0);
    }
}

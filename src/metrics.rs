use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and retrieval activity.
#[derive(Default)]
pub struct PipelineMetrics {
    uploads_accepted: AtomicU64,
    uploads_rejected: AtomicU64,
    jobs_indexed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    chunks_indexed: AtomicU64,
    duplicate_deliveries: AtomicU64,
    searches: AtomicU64,
    orphans_deleted: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an upload that produced a published job.
    pub fn record_upload_accepted(&self) {
        self.uploads_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upload refused before or during publication.
    pub fn record_upload_rejected(&self) {
        self.uploads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job that reached `Indexed` and the number of chunks written for it.
    pub fn record_job_indexed(&self, chunk_count: u64) {
        self.jobs_indexed.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record a failed attempt that was requeued.
    pub fn record_job_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job moved to the dead-letter destination.
    pub fn record_job_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery acknowledged without work because its job was already terminal.
    pub fn record_duplicate_delivery(&self) {
        self.duplicate_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a served search request.
    pub fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record blobs reclaimed by the orphan sweep.
    pub fn record_orphans_deleted(&self, count: u64) {
        self.orphans_deleted.fetch_add(count, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uploads_accepted: self.uploads_accepted.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            jobs_indexed: self.jobs_indexed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            duplicate_deliveries: self.duplicate_deliveries.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            orphans_deleted: self.orphans_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Uploads that were stored and published.
    pub uploads_accepted: u64,
    /// Uploads refused by validation, auth, or a dependency failure.
    pub uploads_rejected: u64,
    /// Jobs that reached `Indexed`.
    pub jobs_indexed: u64,
    /// Failed attempts that were requeued.
    pub jobs_retried: u64,
    /// Jobs moved to the dead-letter destination.
    pub jobs_dead_lettered: u64,
    /// Chunks upserted across all indexed jobs.
    pub chunks_indexed: u64,
    /// Deliveries skipped because the job was already terminal.
    pub duplicate_deliveries: u64,
    /// Search requests served.
    pub searches: u64,
    /// Orphaned blobs deleted by the sweep.
    pub orphans_deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_jobs_and_chunks() {
        let metrics = PipelineMetrics::new();
        metrics.record_job_indexed(2);
        metrics.record_job_indexed(3);
        metrics.record_job_retried();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_indexed, 2);
        assert_eq!(snapshot.chunks_indexed, 5);
        assert_eq!(snapshot.jobs_retried, 1);
    }

    #[test]
    fn snapshot_starts_empty() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}

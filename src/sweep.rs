//! Orphan blob reconciliation.
//!
//! Ingress writes the blob before it records and publishes the job, so a publish failure leaves
//! a blob nothing refers to. The sweep lists the upload bucket and deletes blobs older than the
//! grace period that have no job record. The grace period covers uploads still between the
//! blob write and the job insert.

use crate::error::PipelineError;
use crate::jobs::JobStore;
use crate::metrics::PipelineMetrics;
use crate::storage::BlobStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Blobs past the grace period that were checked.
    pub scanned: usize,
    /// Blobs without a job record.
    pub orphaned: usize,
    /// Orphans successfully deleted.
    pub deleted: usize,
}

/// Deletes blobs that no job refers to.
pub struct OrphanSweeper {
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobStore>,
    metrics: Arc<PipelineMetrics>,
    bucket: String,
    grace: Duration,
}

impl OrphanSweeper {
    /// Sweep `bucket`, leaving blobs younger than `grace` alone.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobStore>,
        metrics: Arc<PipelineMetrics>,
        bucket: String,
        grace: Duration,
    ) -> Self {
        Self {
            blobs,
            jobs,
            metrics,
            bucket,
            grace,
        }
    }

    /// One pass over the bucket.
    pub async fn run_once(&self) -> Result<SweepReport, PipelineError> {
        let cutoff = OffsetDateTime::now_utc() - self.grace;
        let mut report = SweepReport::default();

        for object in self.blobs.list(&self.bucket).await? {
            if object.last_modified > cutoff {
                continue;
            }
            report.scanned += 1;
            if self.jobs.has_job_for_blob(&object.location).await? {
                continue;
            }
            report.orphaned += 1;
            match self.blobs.delete(&object.location).await {
                Ok(()) => {
                    report.deleted += 1;
                    tracing::info!(blob = %object.location, size = object.size_bytes, "Deleted orphaned blob");
                }
                Err(err) => {
                    tracing::warn!(blob = %object.location, error = %err, "Failed to delete orphaned blob");
                }
            }
        }

        self.metrics.record_orphans_deleted(report.deleted as u64);
        tracing::debug!(
            bucket = %self.bucket,
            scanned = report.scanned,
            orphaned = report.orphaned,
            deleted = report.deleted,
            "Orphan sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval` until cancelled. A zero interval disables the sweep.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            tracing::info!("Periodic orphan sweep disabled");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.run_once().await {
                tracing::warn!(error = %err, "Orphan sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::jobs::{IngestionJob, SqliteJobStore};
    use crate::storage::{BlobLocation, MemoryBlobStore, bytes_stream};

    async fn put(store: &MemoryBlobStore, key: &str, age: Duration) -> BlobLocation {
        let location = BlobLocation::new("docs", key);
        store
            .put(&location, bytes_stream("data"), 4, "text/plain")
            .await
            .expect("put");
        store.set_last_modified(&location, OffsetDateTime::now_utc() - age);
        location
    }

    #[tokio::test]
    async fn deletes_only_old_unreferenced_blobs() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let jobs = Arc::new(SqliteJobStore::new(db::connect_in_memory().await.expect("pool")));
        let hour = Duration::from_secs(3600);

        let referenced = put(&blobs, "referenced.txt", hour * 2).await;
        let orphan = put(&blobs, "orphan.txt", hour * 2).await;
        let fresh = put(&blobs, "fresh.txt", Duration::ZERO).await;
        jobs.create(&IngestionJob::pending(
            "job-1".into(),
            "doc".into(),
            referenced.clone(),
            "text/plain".into(),
            4,
        ))
        .await
        .expect("create");

        let metrics = Arc::new(PipelineMetrics::new());
        let sweeper = OrphanSweeper::new(
            blobs.clone(),
            jobs,
            metrics.clone(),
            "docs".into(),
            hour,
        );
        let report = sweeper.run_once().await.expect("sweep");

        assert_eq!(
            report,
            SweepReport {
                scanned: 2,
                orphaned: 1,
                deleted: 1
            }
        );
        assert!(blobs.get(&orphan).await.is_err());
        assert!(blobs.get(&referenced).await.is_ok());
        assert!(blobs.get(&fresh).await.is_ok());
        assert_eq!(metrics.snapshot().orphans_deleted, 1);
    }
}

//! SQLite-backed job store.

use super::{IngestionJob, JobStatus, JobStore, JobStoreError};
use crate::storage::BlobLocation;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use time::OffsetDateTime;

/// Job records in the `jobs` table.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap a migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "SELECT job_id, document_id, bucket, object_key, content_type, \
     size_bytes, status, attempt_count, last_error, created_at, updated_at FROM jobs";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &IngestionJob) -> Result<(), JobStoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO jobs (job_id, document_id, bucket, object_key, content_type, \
             size_bytes, status, attempt_count, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(&job.document_id)
        .bind(&job.blob_location.bucket)
        .bind(&job.blob_location.key)
        .bind(&job.content_type)
        .bind(job.size_bytes as i64)
        .bind(job.status.to_string())
        .bind(i64::from(job.attempt_count))
        .bind(&job.last_error)
        .bind(job.created_at.unix_timestamp())
        .bind(job.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<IngestionJob>, JobStoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE job_id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn save(&self, job: &IngestionJob) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (job_id, document_id, bucket, object_key, content_type, \
             size_bytes, status, attempt_count, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(job_id) DO UPDATE SET \
               status = excluded.status, \
               attempt_count = excluded.attempt_count, \
               last_error = excluded.last_error, \
               updated_at = excluded.updated_at \
             WHERE jobs.status NOT IN ('indexed', 'dead_lettered')",
        )
        .bind(&job.job_id)
        .bind(&job.document_id)
        .bind(&job.blob_location.bucket)
        .bind(&job.blob_location.key)
        .bind(&job.content_type)
        .bind(job.size_bytes as i64)
        .bind(job.status.to_string())
        .bind(i64::from(job.attempt_count))
        .bind(&job.last_error)
        .bind(job.created_at.unix_timestamp())
        .bind(job.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            tracing::debug!(
                job_id = %job.job_id,
                status = %job.status,
                "Job already terminal; save ignored"
            );
        }
        Ok(())
    }

    async fn discard(&self, job_id: &str) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM jobs WHERE job_id = ? AND status = 'pending'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_job_for_blob(&self, location: &BlobLocation) -> Result<bool, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE bucket = ? AND object_key = ?")
                .bind(&location.bucket)
                .bind(&location.key)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }
}

fn decode_row(row: &SqliteRow) -> Result<IngestionJob, JobStoreError> {
    let job_id: String = row.try_get("job_id")?;
    let corrupt = |reason: String| JobStoreError::Corrupt {
        job_id: job_id.clone(),
        reason,
    };

    let status: String = row.try_get("status")?;
    let status: JobStatus = status.parse().map_err(|err| corrupt(format!("{err}")))?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let created_at = timestamp(row.try_get("created_at")?).map_err(&corrupt)?;
    let updated_at = timestamp(row.try_get("updated_at")?).map_err(&corrupt)?;

    Ok(IngestionJob {
        document_id: row.try_get("document_id")?,
        blob_location: BlobLocation::new(
            row.try_get::<String, _>("bucket")?,
            row.try_get::<String, _>("object_key")?,
        ),
        content_type: row.try_get("content_type")?,
        size_bytes: u64::try_from(size_bytes).map_err(|err| corrupt(err.to_string()))?,
        status,
        attempt_count: u32::try_from(attempt_count).map_err(|err| corrupt(err.to_string()))?,
        created_at,
        updated_at,
        last_error: row.try_get("last_error")?,
        job_id,
    })
}

fn timestamp(seconds: i64) -> Result<OffsetDateTime, String> {
    OffsetDateTime::from_unix_timestamp(seconds).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::jobs::Stage;

    async fn store() -> SqliteJobStore {
        SqliteJobStore::new(db::connect_in_memory().await.expect("pool"))
    }

    fn job(job_id: &str) -> IngestionJob {
        IngestionJob::pending(
            job_id.into(),
            "doc-1".into(),
            BlobLocation::new("docs", format!("1_x_{job_id}.txt")),
            "text/plain".into(),
            42,
        )
    }

    #[tokio::test]
    async fn create_is_insert_if_absent() {
        let store = store().await;
        let mut original = job("a");
        store.create(&original).await.expect("create");

        original.last_error = Some("should not overwrite".into());
        store.create(&original).await.expect("create again");

        let loaded = store.get("a").await.expect("get").expect("present");
        assert_eq!(loaded.last_error, None);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.size_bytes, 42);
    }

    #[tokio::test]
    async fn save_persists_transitions() {
        let store = store().await;
        let mut record = job("b");
        store.create(&record).await.expect("create");

        record.transition(JobStatus::Extracting).expect("transition");
        record.attempt_count = 1;
        record
            .transition(JobStatus::Failed(Stage::Extracting))
            .expect("transition");
        record.last_error = Some("timeout".into());
        store.save(&record).await.expect("save");

        let loaded = store.get("b").await.expect("get").expect("present");
        assert_eq!(loaded.status, JobStatus::Failed(Stage::Extracting));
        assert_eq!(loaded.attempt_count, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn terminal_records_are_not_overwritten() {
        let store = store().await;
        let mut finished = job("t");
        store.create(&finished).await.expect("create");
        for next in [
            JobStatus::Extracting,
            JobStatus::Chunking,
            JobStatus::Embedding,
            JobStatus::Indexing,
            JobStatus::Indexed,
        ] {
            finished.transition(next).expect("transition");
        }
        store.save(&finished).await.expect("save");

        // A stale copy of the same job still thinks it is mid-pipeline.
        let mut stale = job("t");
        stale.transition(JobStatus::Extracting).expect("transition");
        stale
            .transition(JobStatus::Failed(Stage::Extracting))
            .expect("transition");
        stale.last_error = Some("late failure".into());
        store.save(&stale).await.expect("save");

        let loaded = store.get("t").await.expect("get").expect("present");
        assert_eq!(loaded.status, JobStatus::Indexed);
        assert_eq!(loaded.last_error, None);
    }

    #[tokio::test]
    async fn discard_only_removes_pending_records() {
        let store = store().await;
        let pending = job("c");
        let mut started = job("d");
        store.create(&pending).await.expect("create");
        started.transition(JobStatus::Extracting).expect("transition");
        store.save(&started).await.expect("save");

        store.discard("c").await.expect("discard");
        store.discard("d").await.expect("discard");

        assert!(store.get("c").await.expect("get").is_none());
        assert!(store.get("d").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn blob_lookup_matches_bucket_and_key() {
        let store = store().await;
        let record = job("e");
        store.create(&record).await.expect("create");

        assert!(store.has_job_for_blob(&record.blob_location).await.expect("lookup"));
        assert!(
            !store
                .has_job_for_blob(&BlobLocation::new("docs", "other"))
                .await
                .expect("lookup")
        );
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        assert!(store().await.get("nope").await.expect("get").is_none());
    }
}

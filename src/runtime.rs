//! Process wiring: builds every service from a [`Config`].
//!
//! [`Runtime::connect`] talks to the real broker, object store and Qdrant. [`Runtime::standalone`]
//! keeps queue, blobs and vectors in memory so a single process can run the whole pipeline
//! against nothing but a SQLite file.

use crate::auth::{CredentialAuthority, SqliteUserStore, TokenSigner};
use crate::chunking::{Chunker, ChunkerSettings};
use crate::config::{Config, EmbeddingProvider};
use crate::db;
use crate::embedding::{EmbeddingClient, HashingEmbedder, OllamaEmbedder};
use crate::error::StartupError;
use crate::extraction::DefaultExtractor;
use crate::index::{MemoryIndex, QdrantIndex, QdrantSettings, VectorIndex};
use crate::ingress::{IngressService, IngressSettings};
use crate::jobs::{JobStore, SqliteJobStore};
use crate::metrics::PipelineMetrics;
use crate::query::{QueryService, QuerySettings};
use crate::queue::{AmqpQueue, JobQueue, MemoryQueue};
use crate::service::Pipeline;
use crate::storage::{BlobStore, MemoryBlobStore, S3BlobStore, S3Settings};
use crate::sweep::OrphanSweeper;
use crate::worker::{RetryPolicy, WorkerContext, WorkerSettings};
use sqlx::SqlitePool;
use std::sync::Arc;

/// External collaborators the services are built on.
pub struct Parts {
    /// Database holding users and job records.
    pub pool: SqlitePool,
    /// Job broker.
    pub queue: Arc<dyn JobQueue>,
    /// Blob store for uploads.
    pub blobs: Arc<dyn BlobStore>,
    /// Vector index, already prepared for the embedding dimension.
    pub index: Arc<dyn VectorIndex>,
    /// Embedding provider.
    pub embedder: Arc<dyn EmbeddingClient>,
}

/// Fully wired services for one process.
pub struct Runtime {
    /// Facade served over HTTP.
    pub pipeline: Arc<Pipeline>,
    /// Shared state for worker tasks.
    pub worker: Arc<WorkerContext>,
    /// Orphan blob reconciliation.
    pub sweeper: OrphanSweeper,
    /// Job broker, closed on shutdown.
    pub queue: Arc<dyn JobQueue>,
    /// Shared counters.
    pub metrics: Arc<PipelineMetrics>,
}

impl Runtime {
    /// Connect to the configured broker, object store and Qdrant.
    pub async fn connect(config: &Config) -> Result<Self, StartupError> {
        let pool = db::connect(&config.database_url).await?;
        let queue = Arc::new(AmqpQueue::connect(&config.broker_url, &config.queue_name).await?);

        let blobs = S3BlobStore::new(
            S3Settings {
                endpoint: config.object_store_endpoint.clone(),
                region: config.object_store_region.clone(),
                access_key: config.object_store_access_key.clone(),
                secret_key: config.object_store_secret_key.clone(),
            },
            config.call_timeout,
        )?;
        blobs.ensure_bucket(&config.object_store_bucket).await?;

        let index = QdrantIndex::new(QdrantSettings {
            url: config.qdrant_url.clone(),
            collection: config.qdrant_collection_name.clone(),
            api_key: config.qdrant_api_key.clone(),
            timeout: config.call_timeout,
        })?;
        index.ensure_ready(config.embedding_dimension).await?;

        Self::from_parts(
            config,
            Parts {
                pool,
                queue,
                blobs: Arc::new(blobs),
                index: Arc::new(index),
                embedder: build_embedder(config)?,
            },
        )
    }

    /// Single-process mode with in-memory queue, blob store and index.
    pub async fn standalone(config: &Config) -> Result<Self, StartupError> {
        let pool = db::connect(&config.database_url).await?;
        let blobs = MemoryBlobStore::new();
        blobs.ensure_bucket(&config.object_store_bucket).await?;
        let index = MemoryIndex::new();
        index.ensure_ready(config.embedding_dimension).await?;
        tracing::warn!("Running standalone: queued jobs, blobs and vectors are lost on exit");

        Self::from_parts(
            config,
            Parts {
                pool,
                queue: Arc::new(MemoryQueue::new()),
                blobs: Arc::new(blobs),
                index: Arc::new(index),
                embedder: build_embedder(config)?,
            },
        )
    }

    /// Build the services over already connected collaborators.
    pub fn from_parts(config: &Config, parts: Parts) -> Result<Self, StartupError> {
        let Parts {
            pool,
            queue,
            blobs,
            index,
            embedder,
        } = parts;
        let metrics = Arc::new(PipelineMetrics::new());
        let jobs: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool.clone()));
        let token_ttl = time::Duration::seconds(
            i64::try_from(config.token_ttl.as_secs()).unwrap_or(i64::MAX),
        );
        let authority = Arc::new(CredentialAuthority::new(
            Arc::new(SqliteUserStore::new(pool)),
            TokenSigner::new(config.token_signing_secret.as_bytes(), token_ttl),
            config.password_hash_cost,
        ));
        let chunker = Arc::new(Chunker::new(&ChunkerSettings {
            chunk_size: config.chunk_size,
            overlap: config.chunk_overlap,
            tokenizer_model: config.tokenizer_model.clone(),
        })?);

        let ingress = IngressService::new(
            authority.clone(),
            blobs.clone(),
            jobs.clone(),
            queue.clone(),
            metrics.clone(),
            IngressSettings {
                bucket: config.object_store_bucket.clone(),
                max_upload_bytes: config.max_upload_bytes,
                call_timeout: config.call_timeout,
            },
        );
        let query = QueryService::new(
            authority.clone(),
            embedder.clone(),
            index.clone(),
            metrics.clone(),
            QuerySettings {
                max_top_k: config.search_max_top_k,
                call_timeout: config.call_timeout,
            },
        );
        let pipeline = Arc::new(Pipeline::new(
            authority,
            ingress,
            query,
            jobs.clone(),
            metrics.clone(),
        ));

        let worker = Arc::new(WorkerContext {
            queue: queue.clone(),
            blobs: blobs.clone(),
            jobs: jobs.clone(),
            extractor: Arc::new(DefaultExtractor::new()),
            chunker,
            embedder,
            index,
            metrics: metrics.clone(),
            settings: WorkerSettings {
                max_attempts: config.max_attempts,
                call_timeout: config.call_timeout,
                embedding_batch_size: config.embedding_batch_size,
                retry: RetryPolicy {
                    base: config.retry_backoff,
                    max: config.retry_backoff_max,
                },
            },
        });
        let sweeper = OrphanSweeper::new(
            blobs,
            jobs,
            metrics.clone(),
            config.object_store_bucket.clone(),
            config.orphan_grace,
        );

        Ok(Self {
            pipeline,
            worker,
            sweeper,
            queue,
            metrics,
        })
    }
}

/// Embedding client selected by `EMBEDDING_PROVIDER`.
pub fn build_embedder(config: &Config) -> Result<Arc<dyn EmbeddingClient>, StartupError> {
    let embedder: Arc<dyn EmbeddingClient> = match config.embedding_provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.embedding_dimension)?),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
            &config.ollama_url,
            &config.embedding_model,
            config.embedding_dimension,
            config.call_timeout,
        )?),
    };
    tracing::info!(
        provider = ?config.embedding_provider,
        dimension = config.embedding_dimension,
        "Embedding provider ready"
    );
    Ok(embedder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::PipelineApi;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned()).expect("config")
    }

    #[test]
    fn hashing_provider_is_the_default() {
        let config = config(&[("TOKEN_SIGNING_SECRET", "s"), ("EMBEDDING_DIMENSION", "32")]);
        let embedder = build_embedder(&config).expect("embedder");
        assert_eq!(embedder.dimension(), 32);
    }

    #[tokio::test]
    async fn from_parts_wires_a_usable_pipeline() {
        let config = config(&[
            ("TOKEN_SIGNING_SECRET", "s"),
            ("EMBEDDING_DIMENSION", "16"),
            ("PASSWORD_HASH_COST", "4"),
            ("TOKENIZER_MODEL", "whitespace"),
            ("MAX_UPLOAD_BYTES", "2048"),
        ]);
        let index = Arc::new(MemoryIndex::new());
        index.ensure_ready(16).await.expect("ready");
        let runtime = Runtime::from_parts(
            &config,
            Parts {
                pool: db::connect_in_memory().await.expect("pool"),
                queue: Arc::new(MemoryQueue::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                index,
                embedder: build_embedder(&config).expect("embedder"),
            },
        )
        .expect("runtime");

        assert_eq!(runtime.pipeline.max_upload_bytes(), 2048);
        runtime
            .pipeline
            .signup("ada", "analytical")
            .await
            .expect("signup");
        let issued = runtime
            .pipeline
            .login("ada", "analytical")
            .await
            .expect("login");
        assert!(!issued.token.is_empty());
        assert_eq!(runtime.worker.settings.max_attempts, 5);
    }
}

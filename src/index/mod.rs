//! Vector index for chunk embeddings.
//!
//! Points are keyed by chunk id, so writing the same chunk twice overwrites it in place. That
//! is the whole idempotency story for redelivered jobs: the worker may upsert a document's
//! chunks any number of times and the index converges on one point per chunk.

mod memory;
mod payload;
mod qdrant;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryIndex;
pub use qdrant::{QdrantIndex, QdrantSettings};

/// Errors returned by vector indexes.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid Qdrant URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The index responded with an unexpected status code.
    #[error("Unexpected index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the index.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// A vector or collection does not match the configured dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was prepared for.
        expected: usize,
        /// Dimension that was supplied or found.
        actual: usize,
    },
    /// The index returned data we could not interpret.
    #[error("malformed index response: {0}")]
    MalformedResponse(String),
}

/// Embedded chunk ready for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPoint {
    /// Deterministic chunk identity; doubles as the point id.
    pub chunk_id: Uuid,
    /// Document the chunk was cut from.
    pub document_id: String,
    /// Position across the document.
    pub sequence_index: u32,
    /// Source page.
    pub page: u32,
    /// Chunk text.
    pub text: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
}

/// Search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    /// Chunk identity.
    pub chunk_id: Uuid,
    /// Document the chunk belongs to.
    pub document_id: String,
    /// Position across the document.
    pub sequence_index: u32,
    /// Source page.
    pub page: u32,
    /// Chunk text.
    pub text: String,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Summary describing how an upsert was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Number of new points written.
    pub inserted: usize,
    /// Number of existing points overwritten.
    pub updated: usize,
}

/// Storage for chunk vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Prepare the index for vectors of `dimension` entries. Safe to call repeatedly.
    async fn ensure_ready(&self, dimension: usize) -> Result<(), IndexError>;

    /// Insert or overwrite points by chunk id.
    async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<IndexSummary, IndexError>;

    /// Return up to `top_k` chunks nearest to `vector`.
    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ScoredChunk>, IndexError>;
}

//! Embedding providers.
//!
//! The worker and the query service only see [`EmbeddingClient`]. Two providers ship: a
//! deterministic hashing embedder that needs no external service, and a client for an
//! Ollama-compatible `/api/embed` endpoint.

mod hashing;
mod ollama;

use async_trait::async_trait;
use thiserror::Error;

pub use hashing::HashingEmbedder;
pub use ollama::OllamaEmbedder;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider is temporarily unreachable or overloaded.
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),
    /// Transport failure talking to the provider.
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider returned vectors of the wrong size.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension the provider returned.
        actual: usize,
    },
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for each supplied chunk of text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;

    /// Length of every vector this client returns.
    fn dimension(&self) -> usize;
}

pub(crate) fn check_dimensions(
    embeddings: &[Vec<f32>],
    expected: usize,
) -> Result<(), EmbeddingClientError> {
    match embeddings.iter().find(|vector| vector.len() != expected) {
        Some(vector) => Err(EmbeddingClientError::DimensionMismatch {
            expected,
            actual: vector.len(),
        }),
        None => Ok(()),
    }
}

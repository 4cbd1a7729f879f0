//! Semantic search over indexed chunks.

use crate::auth::CredentialAuthority;
use crate::embedding::EmbeddingClient;
use crate::error::{PipelineError, with_timeout};
use crate::index::{ScoredChunk, VectorIndex};
use crate::metrics::PipelineMetrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Query tunables.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Upper bound applied to requested `top_k`.
    pub max_top_k: usize,
    /// Deadline for each external call.
    pub call_timeout: Duration,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Chunk identity.
    pub chunk_id: Uuid,
    /// Document the chunk belongs to.
    pub document_id: String,
    /// Chunk text.
    pub text: String,
    /// Cosine similarity to the query.
    pub score: f32,
    /// Position of the chunk in its document.
    pub sequence_index: u32,
    /// Source page.
    pub page: u32,
}

impl From<ScoredChunk> for SearchHit {
    fn from(chunk: ScoredChunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            document_id: chunk.document_id,
            text: chunk.text,
            score: chunk.score,
            sequence_index: chunk.sequence_index,
            page: chunk.page,
        }
    }
}

/// Read-only search front end.
pub struct QueryService {
    authority: Arc<CredentialAuthority>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    metrics: Arc<PipelineMetrics>,
    settings: QuerySettings,
}

impl QueryService {
    /// Wire the service to its collaborators.
    pub fn new(
        authority: Arc<CredentialAuthority>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        metrics: Arc<PipelineMetrics>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            authority,
            embedder,
            index,
            metrics,
            settings,
        }
    }

    /// Return up to `top_k` chunks most similar to `query_text`.
    pub async fn search(
        &self,
        token: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        let user_id = self.authority.validate_token(token)?;
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(PipelineError::Validation("query text is required".into()));
        }
        if top_k == 0 {
            return Err(PipelineError::Validation("top_k must be at least 1".into()));
        }
        let limit = top_k.min(self.settings.max_top_k);

        let mut vectors = with_timeout(
            "query embedding",
            self.settings.call_timeout,
            self.embedder.generate_embeddings(vec![query_text.to_string()]),
        )
        .await?;
        let vector = vectors.pop().ok_or_else(|| {
            PipelineError::PermanentProcessing("embedding provider returned no vector".into())
        })?;
        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(PipelineError::PermanentProcessing(format!(
                "query vector has dimension {}, index expects {expected}",
                vector.len()
            )));
        }

        // Equal scores straddling the cutoff are resolved here, not by the index.
        let fetch = limit.saturating_mul(2).saturating_add(TIE_MARGIN);
        let chunks = with_timeout(
            "index query",
            self.settings.call_timeout,
            self.index.query(vector, fetch),
        )
        .await?;
        let mut hits: Vec<SearchHit> = chunks.into_iter().map(SearchHit::from).collect();
        sort_hits(&mut hits);
        hits.truncate(limit);

        self.metrics.record_search();
        tracing::debug!(user_id = %user_id, top_k = limit, hits = hits.len(), "Search completed");
        Ok(hits)
    }
}

const TIE_MARGIN: usize = 8;

/// Score descending, then sequence index ascending, then chunk id.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.sequence_index.cmp(&b.sequence_index))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

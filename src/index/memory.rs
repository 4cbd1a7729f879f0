use super::{ChunkPoint, IndexError, IndexSummary, ScoredChunk, VectorIndex};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;

/// In-process [`VectorIndex`] using exact cosine similarity.
#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    dimension: Option<usize>,
    points: BTreeMap<Uuid, ChunkPoint>,
}

impl MemoryIndex {
    /// Empty index; the dimension is fixed by the first [`VectorIndex::ensure_ready`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored points.
    pub fn len(&self) -> usize {
        self.state.lock().points.len()
    }

    /// Whether the index holds no points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored points for one document, in sequence order.
    pub fn points_for_document(&self, document_id: &str) -> Vec<ChunkPoint> {
        let mut points: Vec<ChunkPoint> = self
            .state
            .lock()
            .points
            .values()
            .filter(|point| point.document_id == document_id)
            .cloned()
            .collect();
        points.sort_by_key(|point| point.sequence_index);
        points
    }
}

fn check_dimension(expected: Option<usize>, actual: usize) -> Result<(), IndexError> {
    match expected {
        Some(expected) if expected != actual => {
            Err(IndexError::DimensionMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self, dimension: usize) -> Result<(), IndexError> {
        let mut state = self.state.lock();
        check_dimension(state.dimension, dimension)?;
        state.dimension = Some(dimension);
        Ok(())
    }

    async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<IndexSummary, IndexError> {
        let mut state = self.state.lock();
        for point in &points {
            check_dimension(state.dimension, point.vector.len())?;
        }
        let mut summary = IndexSummary::default();
        for point in points {
            if state.points.insert(point.chunk_id, point).is_some() {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }
        Ok(summary)
    }

    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        let state = self.state.lock();
        check_dimension(state.dimension, vector.len())?;
        let mut hits: Vec<ScoredChunk> = state
            .points
            .values()
            .map(|point| ScoredChunk {
                chunk_id: point.chunk_id,
                document_id: point.document_id.clone(),
                sequence_index: point.sequence_index,
                page: point.page,
                text: point.text.clone(),
                score: cosine(&vector, &point.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.sequence_index.cmp(&b.sequence_index))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(seq: u32, vector: Vec<f32>) -> ChunkPoint {
        ChunkPoint {
            chunk_id: Uuid::from_u128(u128::from(seq) + 1),
            document_id: "doc".into(),
            sequence_index: seq,
            page: 1,
            text: format!("chunk {seq}"),
            vector,
        }
    }

    #[tokio::test]
    async fn upserting_the_same_chunk_overwrites() {
        let index = MemoryIndex::new();
        index.ensure_ready(2).await.expect("ready");
        let first = index
            .upsert(vec![point(0, vec![1.0, 0.0]), point(1, vec![0.0, 1.0])])
            .await
            .expect("upsert");
        let second = index
            .upsert(vec![point(0, vec![1.0, 0.0])])
            .await
            .expect("upsert");
        assert_eq!(first, IndexSummary { inserted: 2, updated: 0 });
        assert_eq!(second, IndexSummary { inserted: 0, updated: 1 });
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn query_ranks_by_cosine() {
        let index = MemoryIndex::new();
        index.ensure_ready(2).await.expect("ready");
        index
            .upsert(vec![point(0, vec![1.0, 0.0]), point(1, vec![0.6, 0.8])])
            .await
            .expect("upsert");
        let hits = index.query(vec![0.0, 1.0], 1).await.expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sequence_index, 1);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let index = MemoryIndex::new();
        index.ensure_ready(3).await.expect("ready");
        assert!(matches!(
            index.upsert(vec![point(0, vec![1.0])]).await,
            Err(IndexError::DimensionMismatch { expected: 3, actual: 1 })
        ));
        assert!(index.ensure_ready(4).await.is_err());
    }

    #[tokio::test]
    async fn equal_scores_at_the_cutoff_keep_the_earliest_sequence() {
        let index = MemoryIndex::new();
        index.ensure_ready(2).await.expect("ready");
        let points = (0..4u32)
            .map(|seq| ChunkPoint {
                chunk_id: Uuid::from_u128(u128::from(10 - seq)),
                ..point(seq, vec![1.0, 1.0])
            })
            .collect();
        index.upsert(points).await.expect("upsert");

        let hits = index.query(vec![1.0, 1.0], 3).await.expect("query");
        let seqs: Vec<u32> = hits.iter().map(|hit| hit.sequence_index).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}

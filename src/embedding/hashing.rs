use super::{EmbeddingClient, EmbeddingClientError};
use async_trait::async_trait;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric term is hashed into one slot of the vector and the result is
/// L2-normalized, so texts sharing vocabulary score a positive cosine similarity. Useful for
/// standalone runs and tests; it carries no semantic knowledge.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Construct an embedder producing vectors of `dimension` entries.
    pub fn new(dimension: usize) -> Result<Self, EmbeddingClientError> {
        if dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        for term in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|term| !term.is_empty())
        {
            let slot = fnv1a(&term.to_lowercase()) % self.dimension as u64;
            // Slot is bounded by the dimension, which fits in usize.
            embedding[usize::try_from(slot).unwrap_or_default()] += 1.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

fn fnv1a(term: &str) -> u64 {
    term.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

#[async_trait]
impl EmbeddingClient for HashingEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        tracing::debug!(
            provider = "hashing",
            dimension = self.dimension,
            count = texts.len(),
            "Generating embeddings"
        );
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn vectors_are_normalized_and_deterministic() {
        let embedder = HashingEmbedder::new(64).expect("embedder");
        let first = embedder
            .generate_embeddings(vec!["Rust ownership rules".into()])
            .await
            .expect("embed");
        let second = embedder
            .generate_embeddings(vec!["rust OWNERSHIP rules".into()])
            .await
            .expect("embed");
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 64);
        let norm: f32 = first[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(256).expect("embedder");
        let vectors = embedder
            .generate_embeddings(vec![
                "borrow checker lifetimes".into(),
                "the borrow checker enforces lifetimes".into(),
                "tomato soup recipe".into(),
            ])
            .await
            .expect("embed");
        assert!(cosine(&vectors[0], &vectors[1]) > cosine(&vectors[0], &vectors[2]));
    }

    #[tokio::test]
    async fn blank_text_yields_zero_vector() {
        let embedder = HashingEmbedder::new(8).expect("embedder");
        let vectors = embedder
            .generate_embeddings(vec!["  ...  ".into()])
            .await
            .expect("embed");
        assert!(vectors[0].iter().all(|value| *value == 0.0));
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }
}

use super::{EmbeddingClient, EmbeddingClientError, check_dimensions};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client for an Ollama-compatible `POST /api/embed` endpoint.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    /// Construct a client for `base_url` that expects vectors of `dimension` entries.
    pub fn new(
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingClientError> {
        if dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        let client = Client::builder()
            .user_agent("docstream/0.1")
            .timeout(timeout)
            .build()?;
        let endpoint = format!("{}/api/embed", base_url.trim_end_matches('/'));
        tracing::debug!(endpoint = %endpoint, model, dimension, "Initialized Ollama embedding client");
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(
            provider = "ollama",
            model = %self.model,
            count = texts.len(),
            "Generating embeddings"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.model,
                input: &texts,
            })
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() || err.is_timeout() {
                    EmbeddingClientError::Unavailable(err.to_string())
                } else {
                    EmbeddingClientError::Http(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("provider responded {status}: {body}");
            tracing::warn!(status = %status, "Embedding request rejected");
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    EmbeddingClientError::Unavailable(message)
                } else {
                    EmbeddingClientError::GenerationFailed(message)
                },
            );
        }

        let EmbedResponse { embeddings } = response.json().await?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingClientError::GenerationFailed(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                embeddings.len()
            )));
        }
        check_dimensions(&embeddings, self.dimension)?;
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn embedder(server: &MockServer, dimension: usize) -> OllamaEmbedder {
        OllamaEmbedder::new(
            &server.base_url(),
            "nomic-embed-text",
            dimension,
            Duration::from_secs(5),
        )
        .expect("embedder")
    }

    #[tokio::test]
    async fn posts_batch_and_returns_vectors_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed").json_body(json!({
                    "model": "nomic-embed-text",
                    "input": ["first", "second"],
                }));
                then.status(200).json_body(json!({
                    "model": "nomic-embed-text",
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]],
                }));
            })
            .await;

        let vectors = embedder(&server, 2)
            .generate_embeddings(vec!["first".into(), "second".into()])
            .await
            .expect("embeddings");

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn server_errors_are_unavailable_and_client_errors_are_not() {
        let server = MockServer::start_async().await;
        let mut overloaded = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(503).body("loading model");
            })
            .await;
        let err = embedder(&server, 2)
            .generate_embeddings(vec!["text".into()])
            .await
            .expect_err("unavailable");
        assert!(matches!(err, EmbeddingClientError::Unavailable(_)));
        overloaded.delete_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(400).body("model not found");
            })
            .await;
        let err = embedder(&server, 2)
            .generate_embeddings(vec!["text".into()])
            .await
            .expect_err("rejected");
        assert!(matches!(err, EmbeddingClientError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn wrong_dimension_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .json_body(json!({ "embeddings": [[0.1, 0.2, 0.3]] }));
            })
            .await;
        let err = embedder(&server, 2)
            .generate_embeddings(vec!["text".into()])
            .await
            .expect_err("mismatch");
        assert!(matches!(
            err,
            EmbeddingClientError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }
}

//! HTTP client for a Qdrant collection holding chunk points.

use super::payload::{
    INDEXED_FIELDS, build_payload, current_timestamp_rfc3339, scored_chunk_from_payload,
};
use super::{ChunkPoint, IndexError, IndexSummary, ScoredChunk, VectorIndex};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Connection settings for [`QdrantIndex`].
#[derive(Debug, Clone)]
pub struct QdrantSettings {
    /// Base URL, e.g. `http://localhost:6333`.
    pub url: String,
    /// Collection holding chunk points.
    pub collection: String,
    /// Optional API key sent as the `api-key` header.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Qdrant-backed [`VectorIndex`].
pub struct QdrantIndex {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
struct QueryPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    result: Vec<RetrievedPoint>,
}

#[derive(Deserialize)]
struct RetrievedPoint {
    id: Value,
}

impl QdrantIndex {
    /// Construct a client; no request is made until [`VectorIndex::ensure_ready`].
    pub fn new(settings: QdrantSettings) -> Result<Self, IndexError> {
        let client = Client::builder()
            .user_agent("docstream/0.1")
            .timeout(settings.timeout)
            .build()?;

        let base_url = normalize_base_url(&settings.url).map_err(IndexError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection = %settings.collection,
            has_api_key = settings
                .api_key
                .as_deref()
                .is_some_and(|value| !value.is_empty()),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key,
            collection: settings.collection,
        })
    }

    /// Vector size of the existing collection, or `None` when it does not exist.
    async fn collection_vector_size(&self) -> Result<Option<usize>, IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: Value = response.json().await?;
                body.pointer("/result/config/params/vectors/size")
                    .and_then(Value::as_u64)
                    .and_then(|size| usize::try_from(size).ok())
                    .map(Some)
                    .ok_or_else(|| {
                        IndexError::MalformedResponse("collection info lacks a vector size".into())
                    })
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = IndexError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn create_collection(&self, dimension: usize) -> Result<(), IndexError> {
        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            // Another process created it first.
            StatusCode::CONFLICT => Ok(()),
            _ => {
                ensure_success(response, || {
                    tracing::info!(collection = %self.collection, dimension, "Collection created");
                })
                .await
            }
        }
    }

    async fn ensure_payload_indexes(&self) -> Result<(), IndexError> {
        for (field, schema) in INDEXED_FIELDS {
            let body = json!({
                "field_name": field,
                "field_schema": schema,
            });

            let response = self
                .request(Method::PUT, &format!("collections/{}/index", self.collection))
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection = %self.collection, field, schema, "Payload index ensured");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = IndexError::UnexpectedStatus { status, body };
                tracing::warn!(collection = %self.collection, field, schema, error = %error, "Failed to ensure payload index");
            }
        }

        Ok(())
    }

    /// Ids among `ids` that already exist in the collection.
    async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, IndexError> {
        let body = json!({
            "ids": ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
            "with_payload": false,
            "with_vector": false,
        });
        let response = self
            .request(Method::POST, &format!("collections/{}/points", self.collection))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::UnexpectedStatus { status, body });
        }
        let RetrieveResponse { result } = response.json().await?;
        Ok(result
            .into_iter()
            .filter_map(|point| parse_point_id(&point.id).ok())
            .collect())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self, dimension: usize) -> Result<(), IndexError> {
        match self.collection_vector_size().await? {
            Some(size) if size != dimension => {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: size,
                });
            }
            Some(_) => {}
            None => self.create_collection(dimension).await?,
        }
        self.ensure_payload_indexes().await
    }

    async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<IndexSummary, IndexError> {
        if points.is_empty() {
            return Ok(IndexSummary::default());
        }

        let ids: Vec<Uuid> = points.iter().map(|point| point.chunk_id).collect();
        let existing = self.existing_ids(&ids).await?;

        let now = current_timestamp_rfc3339();
        let serialized: Vec<_> = points
            .iter()
            .map(|point| {
                json!({
                    "id": point.chunk_id.to_string(),
                    "vector": point.vector,
                    "payload": build_payload(point, &now),
                })
            })
            .collect();

        let point_count = serialized.len();
        let response = self
            .request(Method::PUT, &format!("collections/{}/points", self.collection))
            .query(&[("wait", true)])
            .json(&json!({ "points": serialized }))
            .send()
            .await?;

        ensure_success(response, || {
            tracing::debug!(collection = %self.collection, points = point_count, "Points upserted");
        })
        .await?;

        let updated = ids.iter().filter(|id| existing.contains(id)).count();
        Ok(IndexSummary {
            inserted: point_count - updated,
            updated,
        })
    }

    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        let body = json!({
            "query": vector,
            "limit": top_k,
            "with_payload": true,
        });

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.collection),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = IndexError::UnexpectedStatus { status, body };
            tracing::error!(collection = %self.collection, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) | QueryResponseResult::Object { points } => points,
        };
        points
            .into_iter()
            .map(|point| {
                let chunk_id = parse_point_id(&point.id)?;
                let payload = point.payload.unwrap_or_default();
                scored_chunk_from_payload(chunk_id, point.score, &payload)
            })
            .collect()
    }
}

async fn ensure_success<F>(response: reqwest::Response, on_success: F) -> Result<(), IndexError>
where
    F: FnOnce(),
{
    if response.status().is_success() {
        on_success();
        Ok(())
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = IndexError::UnexpectedStatus { status, body };
        tracing::error!(error = %error, "Qdrant request failed");
        Err(error)
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn parse_point_id(id: &Value) -> Result<Uuid, IndexError> {
    let text = match id {
        Value::String(text) => text.as_str(),
        Value::Object(map) => map.get("uuid").and_then(Value::as_str).unwrap_or_default(),
        _ => "",
    };
    Uuid::parse_str(text)
        .map_err(|_| IndexError::MalformedResponse(format!("point id {id} is not a chunk id")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{
        Method::{GET, POST, PUT},
        MockServer,
    };

    fn index(server: &MockServer) -> QdrantIndex {
        QdrantIndex::new(QdrantSettings {
            url: server.base_url(),
            collection: "chunks".into(),
            api_key: Some("secret".into()),
            timeout: Duration::from_secs(5),
        })
        .expect("index")
    }

    fn point(chunk_id: Uuid) -> ChunkPoint {
        ChunkPoint {
            chunk_id,
            document_id: "doc".into(),
            sequence_index: 0,
            page: 1,
            text: "hello".into(),
            vector: vec![0.1, 0.2],
        }
    }

    #[tokio::test]
    async fn ensure_ready_creates_missing_collection_and_indexes() {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/chunks");
                then.status(404);
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/chunks")
                    .header("api-key", "secret")
                    .json_body(json!({ "vectors": { "size": 2, "distance": "Cosine" } }));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let indexes = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/chunks/index");
                then.status(200).json_body(json!({ "result": {} }));
            })
            .await;

        index(&server).ensure_ready(2).await.expect("ready");

        lookup.assert_async().await;
        create.assert_async().await;
        indexes.assert_hits_async(INDEXED_FIELDS.len()).await;
    }

    #[tokio::test]
    async fn ensure_ready_rejects_mismatched_collection() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/chunks");
                then.status(200).json_body(json!({
                    "result": { "config": { "params": { "vectors": { "size": 768, "distance": "Cosine" } } } }
                }));
            })
            .await;

        let err = index(&server).ensure_ready(2).await.expect_err("mismatch");
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 768
            }
        ));
    }

    #[tokio::test]
    async fn upsert_counts_existing_points_as_updates() {
        let server = MockServer::start_async().await;
        let known = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/chunks/points");
                then.status(200)
                    .json_body(json!({ "result": [ { "id": known.to_string() } ] }));
            })
            .await;
        let write = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/chunks/points")
                    .query_param("wait", "true");
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;

        let summary = index(&server)
            .upsert(vec![point(known), point(fresh)])
            .await
            .expect("upsert");

        write.assert_async().await;
        assert_eq!(
            summary,
            IndexSummary {
                inserted: 1,
                updated: 1
            }
        );
    }

    #[tokio::test]
    async fn query_parses_hits() {
        let server = MockServer::start_async().await;
        let chunk_id = Uuid::new_v4();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/chunks/points/query");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "result": {
                        "points": [
                            {
                                "id": chunk_id.to_string(),
                                "score": 0.42,
                                "payload": {
                                    "document_id": "doc",
                                    "sequence_index": 3,
                                    "page": 2,
                                    "text": "Example"
                                }
                            }
                        ]
                    }
                }));
            })
            .await;

        let hits = index(&server).query(vec![0.1, 0.2], 3).await.expect("query");

        mock.assert_async().await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, chunk_id);
        assert_eq!(hits[0].page, 2);
        assert!((hits[0].score - 0.42).abs() < f32::EPSILON);
    }
}

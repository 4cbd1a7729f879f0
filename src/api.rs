//! HTTP surface for docstream.
//!
//! - `POST /signup` – Register `{user_id, password}`.
//! - `POST /login` – Exchange credentials for `{token, expires_at}`.
//! - `POST /upload` – Multipart upload (bearer). An optional `size` text field must precede the
//!   `file` part; with it the file streams straight to the blob store, without it the part is
//!   spooled to a temporary file first to learn its size. Returns `{job_id, document_id}`.
//! - `POST /search` – `{query_text, top_k}` (bearer) returning ranked chunks.
//! - `GET /jobs/{job_id}` – Job record with status, attempts and last error (bearer).
//! - `GET /metrics` – Pipeline counters.
//! - `GET /health` – Liveness.
//!
//! Errors are returned as `{"error": {"kind", "message"}}` with a status derived from the
//! error class.

use crate::error::PipelineError;
use crate::ingress::{UploadReceipt, UploadRequest};
use crate::jobs::IngestionJob;
use crate::metrics::MetricsSnapshot;
use crate::query::SearchHit;
use crate::service::PipelineApi;
use crate::storage::ByteStream;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::Field},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

const DEFAULT_TOP_K: usize = 10;
/// Allowance for multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;
const UPLOAD_CHANNEL_DEPTH: usize = 8;

type BearerHeader = Option<TypedHeader<Authorization<Bearer>>>;

/// Build the HTTP router.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: PipelineApi + 'static,
{
    let body_limit = usize::try_from(service.max_upload_bytes().saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);
    Router::new()
        .route("/health", get(health))
        .route("/signup", post(signup::<S>))
        .route("/login", post(login::<S>))
        .route(
            "/upload",
            post(upload::<S>).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/search", post(search::<S>))
        .route("/jobs/:job_id", get(job_status::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .with_state(service)
}

fn bearer_token(header: BearerHeader) -> String {
    header
        .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string())
        .unwrap_or_default()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Request body for `POST /signup` and `POST /login`.
#[derive(Deserialize)]
struct Credentials {
    user_id: String,
    password: String,
}

#[derive(Serialize)]
struct SignupResponse {
    user_id: String,
}

async fn signup<S>(
    State(service): State<Arc<S>>,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<SignupResponse>), AppError>
where
    S: PipelineApi,
{
    let user_id = credentials.user_id.trim().to_string();
    service.signup(&user_id, &credentials.password).await?;
    Ok((StatusCode::CREATED, Json(SignupResponse { user_id })))
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_at: String,
}

async fn login<S>(
    State(service): State<Arc<S>>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<LoginResponse>, AppError>
where
    S: PipelineApi,
{
    let issued = service
        .login(&credentials.user_id, &credentials.password)
        .await?;
    let expires_at = issued
        .expires_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| issued.expires_at.unix_timestamp().to_string());
    Ok(Json(LoginResponse {
        token: issued.token,
        expires_at,
    }))
}

async fn upload<S>(
    State(service): State<Arc<S>>,
    bearer: BearerHeader,
    mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, AppError>
where
    S: PipelineApi,
{
    let token = bearer_token(bearer);
    // Reject bad credentials before any part of the body is read or spooled.
    service.authenticate(&token).await?;
    let mut declared_size: Option<u64> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("size") => {
                let text = field.text().await.map_err(multipart_error)?;
                let size = text.trim().parse::<u64>().map_err(|_| {
                    PipelineError::Validation(format!("size '{}' is not a byte count", text.trim()))
                })?;
                declared_size = Some(size);
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let receipt = match declared_size {
                    Some(size) => {
                        stream_upload(service.as_ref(), &token, field, file_name, content_type, size)
                            .await?
                    }
                    None => {
                        spooled_upload(service.as_ref(), &token, field, file_name, content_type)
                            .await?
                    }
                };
                return Ok(Json(receipt));
            }
            _ => {
                tracing::debug!(field = ?name, "Ignoring unknown multipart field");
            }
        }
    }

    Err(PipelineError::Validation("multipart body has no 'file' part".into()).into())
}

/// Forward the part to the service through a bounded channel while it uploads.
async fn stream_upload<S>(
    service: &S,
    token: &str,
    mut field: Field<'_>,
    file_name: String,
    content_type: String,
    size: u64,
) -> Result<UploadReceipt, PipelineError>
where
    S: PipelineApi + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(UPLOAD_CHANNEL_DEPTH);
    let body: ByteStream = Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    });

    let pump = async move {
        loop {
            let item = match field.chunk().await {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => break,
                Err(err) => Err(io::Error::other(err.to_string())),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    };
    let request = UploadRequest {
        file_name,
        content_type,
        size,
        body,
    };
    let ((), receipt) = tokio::join!(pump, service.upload(token, request));
    receipt
}

/// Write the part to an anonymous temporary file, then upload it with its measured size.
async fn spooled_upload<S>(
    service: &S,
    token: &str,
    mut field: Field<'_>,
    file_name: String,
    content_type: String,
) -> Result<UploadReceipt, PipelineError>
where
    S: PipelineApi + ?Sized,
{
    let spool_error = |err: io::Error| {
        PipelineError::TransientDependency(format!("failed to spool upload: {err}"))
    };
    let limit = service.max_upload_bytes();
    let file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(|err| spool_error(io::Error::other(err)))?
        .map_err(spool_error)?;
    let mut file = tokio::fs::File::from_std(file);

    let mut size = 0_u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        size += chunk.len() as u64;
        if size > limit {
            return Err(PipelineError::Validation(format!(
                "upload exceeds the {limit} byte limit"
            )));
        }
        file.write_all(&chunk).await.map_err(spool_error)?;
    }
    file.flush().await.map_err(spool_error)?;
    file.rewind().await.map_err(spool_error)?;

    let request = UploadRequest {
        file_name,
        content_type,
        size,
        body: Box::pin(ReaderStream::new(file)),
    };
    service.upload(token, request).await
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> PipelineError {
    PipelineError::Validation(format!("malformed multipart body: {err}"))
}

/// Request body for `POST /search`.
#[derive(Deserialize)]
struct SearchRequest {
    query_text: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn search<S>(
    State(service): State<Arc<S>>,
    bearer: BearerHeader,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError>
where
    S: PipelineApi,
{
    let token = bearer_token(bearer);
    let results = service
        .search(&token, &request.query_text, request.top_k)
        .await?;
    Ok(Json(SearchResponse { results }))
}

async fn job_status<S>(
    State(service): State<Arc<S>>,
    bearer: BearerHeader,
    Path(job_id): Path<String>,
) -> Result<Json<IngestionJob>, AppError>
where
    S: PipelineApi,
{
    let token = bearer_token(bearer);
    Ok(Json(service.job_status(&token, &job_id).await?))
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: PipelineApi,
{
    Json(service.metrics_snapshot())
}

struct AppError(PipelineError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Auth(_) => StatusCode::UNAUTHORIZED,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::TransientDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::PermanentProcessing(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            PipelineError::Auth(err) => err.kind(),
            other => other.kind(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }
        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.0.to_string(),
            }
        }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self(inner)
    }
}

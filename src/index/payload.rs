//! Qdrant payload layout for chunk points.

use super::{ChunkPoint, IndexError, ScoredChunk};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Payload fields that get a keyword index.
pub(crate) const INDEXED_FIELDS: [(&str, &str); 2] =
    [("document_id", "keyword"), ("chunk_hash", "keyword")];

pub(crate) fn build_payload(point: &ChunkPoint, indexed_at: &str) -> Value {
    json!({
        "chunk_id": point.chunk_id.to_string(),
        "document_id": point.document_id,
        "sequence_index": point.sequence_index,
        "page": point.page,
        "text": point.text,
        "chunk_hash": compute_chunk_hash(&point.text),
        "indexed_at": indexed_at,
    })
}

/// Read a query hit back out of its payload.
pub(crate) fn scored_chunk_from_payload(
    chunk_id: Uuid,
    score: f32,
    payload: &Map<String, Value>,
) -> Result<ScoredChunk, IndexError> {
    let text_field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IndexError::MalformedResponse(format!("point {chunk_id} missing '{name}'")))
    };
    let number_field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
            .ok_or_else(|| IndexError::MalformedResponse(format!("point {chunk_id} missing '{name}'")))
    };

    Ok(ScoredChunk {
        chunk_id,
        document_id: text_field("document_id")?,
        sequence_index: number_field("sequence_index")?,
        page: number_field("page")?,
        text: text_field("text")?,
        score,
    })
}

pub(crate) fn compute_chunk_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub(crate) fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

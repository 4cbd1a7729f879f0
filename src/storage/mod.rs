//! Blob storage for uploaded documents.
//!
//! Uploads are streamed into a [`BlobStore`] under an object key that stays unique even when
//! many clients upload files with the same name at the same second. Stores never overwrite an
//! existing key, so a blob referenced by a published job is immutable.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::MemoryBlobStore;
pub use s3::{S3BlobStore, S3Settings};

/// Streamed request body handed to a blob store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send + 'static>>;

/// Address of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobLocation {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key inside the bucket.
    pub key: String,
}

impl BlobLocation {
    /// Build a location from its parts.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Listing entry returned by [`BlobStore::list`].
#[derive(Debug, Clone)]
pub struct BlobObject {
    /// Where the object lives.
    pub location: BlobLocation,
    /// Stored size in bytes.
    pub size_bytes: u64,
    /// Last modification time reported by the store.
    pub last_modified: OffsetDateTime,
}

/// Errors returned by blob stores.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The key is already taken; stores refuse to overwrite.
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Reading the upload body failed.
    #[error("failed to read upload body: {0}")]
    Body(#[source] io::Error),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The store responded with an unexpected status code.
    #[error("Unexpected object store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: reqwest::StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Endpoint configuration could not be parsed.
    #[error("Invalid object store endpoint: {0}")]
    InvalidEndpoint(String),
    /// A listing response could not be parsed.
    #[error("Malformed object listing: {0}")]
    MalformedListing(String),
}

/// Object storage keyed by bucket and object key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the bucket when it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError>;

    /// Stream `body` into a new object of exactly `size` bytes.
    ///
    /// Fails with [`BlobError::AlreadyExists`] when the key is taken.
    async fn put(
        &self,
        location: &BlobLocation,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> Result<(), BlobError>;

    /// Fetch the full object.
    async fn get(&self, location: &BlobLocation) -> Result<Bytes, BlobError>;

    /// List every object in a bucket.
    async fn list(&self, bucket: &str) -> Result<Vec<BlobObject>, BlobError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, location: &BlobLocation) -> Result<(), BlobError>;
}

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn bytes_stream(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes = bytes.into();
    futures_util::stream::once(async move { Ok(bytes) }).boxed()
}

const MAX_KEY_NAME_LEN: usize = 128;

/// Build a collision-free object key for an uploaded file.
///
/// Keys look like `<unix-seconds>_<random>_<sanitized basename>`.
pub fn object_key(file_name: &str, now: OffsetDateTime) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        now.unix_timestamp(),
        &nonce[..12],
        sanitize_file_name(file_name)
    )
}

fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_KEY_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_unique_for_identical_names() {
        let now = OffsetDateTime::now_utc();
        let first = object_key("report.pdf", now);
        let second = object_key("report.pdf", now);
        assert_ne!(first, second);
        assert!(first.starts_with(&format!("{}_", now.unix_timestamp())));
        assert!(first.ends_with("_report.pdf"));
    }

    #[test]
    fn file_names_are_reduced_to_safe_basenames() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\my file (1).txt"), "my_file__1_.txt");
        assert_eq!(sanitize_file_name("..."), "upload");
        assert_eq!(sanitize_file_name(""), "upload");
    }
}

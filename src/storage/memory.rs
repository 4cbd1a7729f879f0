//! In-process blob store used by standalone mode and tests.

use super::{BlobError, BlobLocation, BlobObject, BlobStore, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

struct StoredBlob {
    bytes: Bytes,
    last_modified: OffsetDateTime,
}

/// Blob store backed by a process-local map.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<BlobLocation, StoredBlob>>,
    buckets: Mutex<HashSet<String>>,
    writes: AtomicU64,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Override the modification time of a stored object.
    pub fn set_last_modified(&self, location: &BlobLocation, at: OffsetDateTime) {
        if let Some(blob) = self.objects.lock().get_mut(location) {
            blob.last_modified = at;
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError> {
        self.buckets.lock().insert(bucket.to_string());
        Ok(())
    }

    async fn put(
        &self,
        location: &BlobLocation,
        mut body: ByteStream,
        size: u64,
        _content_type: &str,
    ) -> Result<(), BlobError> {
        if self.objects.lock().contains_key(location) {
            return Err(BlobError::AlreadyExists(location.to_string()));
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk.map_err(BlobError::Body)?);
        }
        if buffer.len() as u64 != size {
            return Err(BlobError::Body(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {size} bytes, received {}", buffer.len()),
            )));
        }

        let mut objects = self.objects.lock();
        if objects.contains_key(location) {
            return Err(BlobError::AlreadyExists(location.to_string()));
        }
        objects.insert(
            location.clone(),
            StoredBlob {
                bytes: buffer.freeze(),
                last_modified: OffsetDateTime::now_utc(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, location: &BlobLocation) -> Result<Bytes, BlobError> {
        self.objects
            .lock()
            .get(location)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| BlobError::NotFound(location.to_string()))
    }

    async fn list(&self, bucket: &str) -> Result<Vec<BlobObject>, BlobError> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(location, _)| location.bucket == bucket)
            .map(|(location, blob)| BlobObject {
                location: location.clone(),
                size_bytes: blob.bytes.len() as u64,
                last_modified: blob.last_modified,
            })
            .collect())
    }

    async fn delete(&self, location: &BlobLocation) -> Result<(), BlobError> {
        self.objects.lock().remove(location);
        Ok(())
    }
}

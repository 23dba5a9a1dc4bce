//! In-memory storage coordinator.
//!
//! Keeps every object in a `DashMap`. Used by the stand-alone binary and by
//! the test suites; it also offers fault injection hooks so the error
//! protocol can be exercised end to end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::{
    CreateRequest, MetadataRecord, ObjectId, ObjectMetadata, StorageCoordinator, StorageError,
    StorageResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectState {
    Pending,
    Closed,
    Gone,
    Corrupted,
}

#[derive(Debug)]
struct StoredObject {
    cache_id: String,
    data: Vec<u8>,
    committed_len: u64,
    commits: u64,
    state: ObjectState,
    metadata: Option<MetadataRecord>,
    created: DateTime<Utc>,
    content_hash: Option<String>,
}

impl StoredObject {
    fn new(cache_id: String, metadata: Option<MetadataRecord>) -> Self {
        Self {
            cache_id,
            data: Vec::new(),
            committed_len: 0,
            commits: 0,
            state: ObjectState::Pending,
            metadata,
            created: Utc::now(),
            content_hash: None,
        }
    }

    fn check_readable(&self, id: &ObjectId) -> StorageResult<()> {
        match self.state {
            ObjectState::Closed => Ok(()),
            ObjectState::Pending => Err(StorageError::NotFound(id.to_string())),
            ObjectState::Gone => Err(StorageError::Gone(id.to_string())),
            ObjectState::Corrupted => Err(StorageError::Corrupted(id.to_string())),
        }
    }

    fn describe(&self, id: &ObjectId) -> ObjectMetadata {
        ObjectMetadata {
            id: id.clone(),
            size: self.data.len() as u64,
            created: self.created,
            content_hash: self.content_hash.clone().unwrap_or_default(),
            query_ready: self.state == ObjectState::Closed && self.metadata.is_some(),
        }
    }
}

/// A storage coordinator that never touches a disk.
#[derive(Debug)]
pub struct MemoryStorage {
    objects: DashMap<ObjectId, StoredObject>,
    /// Writes reaching past this byte offset fail with an I/O error.
    fail_writes_past: AtomicU64,
    /// When set, every commit fails the durability check.
    fail_commits: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            fail_writes_past: AtomicU64::new(u64::MAX),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Store a complete object in one step.
    pub fn insert_object(
        &self,
        cache_id: &str,
        data: &[u8],
        metadata: Option<MetadataRecord>,
    ) -> ObjectMetadata {
        let id = ObjectId::generate();
        let mut object = StoredObject::new(cache_id.to_string(), metadata);
        object.data = data.to_vec();
        object.committed_len = data.len() as u64;
        object.content_hash = Some(hex::encode(Sha256::digest(data)));
        object.state = ObjectState::Closed;
        let described = object.describe(&id);
        self.objects.insert(id, object);
        described
    }

    /// Closed objects of `cache_id` carrying metadata, ordered by id.
    pub fn indexed_objects(&self, cache_id: &str) -> Vec<(ObjectId, MetadataRecord)> {
        let mut indexed: Vec<_> = self
            .objects
            .iter()
            .filter(|entry| {
                let object = entry.value();
                object.cache_id == cache_id && object.state == ObjectState::Closed
            })
            .filter_map(|entry| {
                entry
                    .value()
                    .metadata
                    .clone()
                    .map(|record| (entry.key().clone(), record))
            })
            .collect();
        indexed.sort_by(|a, b| a.0.cmp(&b.0));
        indexed
    }

    /// Whether any object lives in `cache_id`.
    pub fn has_cache(&self, cache_id: &str) -> bool {
        self.objects.iter().any(|entry| entry.value().cache_id == cache_id)
    }

    /// Number of commits issued against an object.
    pub fn commit_count(&self, id: &ObjectId) -> Option<u64> {
        self.objects.get(id).map(|o| o.commits)
    }

    /// Bytes made durable so far.
    pub fn committed_len(&self, id: &ObjectId) -> Option<u64> {
        self.objects.get(id).map(|o| o.committed_len)
    }

    /// Make writes fail once they reach `offset`.
    pub fn fail_writes_past(&self, offset: u64) {
        self.fail_writes_past.store(offset, Ordering::SeqCst);
    }

    /// Make every commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Simulate an unrecoverable loss.
    pub fn mark_gone(&self, id: &ObjectId) {
        if let Some(mut object) = self.objects.get_mut(id) {
            object.state = ObjectState::Gone;
        }
    }

    /// Simulate a segment failing its integrity check.
    pub fn mark_corrupted(&self, id: &ObjectId) {
        if let Some(mut object) = self.objects.get_mut(id) {
            object.state = ObjectState::Corrupted;
        }
    }

    /// Ids of objects still waiting for `close`.
    pub fn pending_objects(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|entry| entry.value().state == ObjectState::Pending)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl StorageCoordinator for MemoryStorage {
    async fn create_object(&self, request: CreateRequest) -> StorageResult<ObjectId> {
        if let Some(link) = &request.link {
            let target = self
                .objects
                .get(link)
                .ok_or_else(|| StorageError::NotFound(link.to_string()))?;
            target.check_readable(link)?;
        }
        let id = ObjectId::generate();
        self.objects
            .insert(id.clone(), StoredObject::new(request.cache_id, request.metadata));
        tracing::trace!(object_id = %id, "Pending object created");
        Ok(id)
    }

    async fn write_data(
        &self,
        id: &ObjectId,
        data: &[u8],
        offset: u64,
        _is_last: bool,
    ) -> StorageResult<()> {
        let end = offset + data.len() as u64;
        if end > self.fail_writes_past.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected write failure at offset {}", offset),
            )));
        }

        let mut object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if object.state != ObjectState::Pending {
            return Err(StorageError::InvalidState {
                id: id.to_string(),
                state: "not writable",
            });
        }
        if offset != object.data.len() as u64 {
            return Err(StorageError::InvalidArgument(format!(
                "non-contiguous write at {} (object has {} bytes)",
                offset,
                object.data.len()
            )));
        }
        object.data.extend_from_slice(data);
        Ok(())
    }

    async fn commit(&self, id: &ObjectId, _flush: bool) -> StorageResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::Durability(format!(
                "could not reach write quorum for {}",
                id
            )));
        }
        let mut object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        object.committed_len = object.data.len() as u64;
        object.commits += 1;
        Ok(())
    }

    async fn close(&self, id: &ObjectId) -> StorageResult<ObjectMetadata> {
        let mut object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if object.state != ObjectState::Pending {
            return Err(StorageError::InvalidState {
                id: id.to_string(),
                state: "already closed",
            });
        }
        object.committed_len = object.data.len() as u64;
        object.content_hash = Some(hex::encode(Sha256::digest(&object.data)));
        object.state = ObjectState::Closed;
        Ok(object.describe(id))
    }

    async fn read_data(
        &self,
        id: &ObjectId,
        segments: &mut [&mut [u8]],
        offset: u64,
        length: u64,
        _is_last_read: bool,
    ) -> StorageResult<u64> {
        let object = self
            .objects
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        object.check_readable(id)?;

        let size = object.data.len() as u64;
        if offset >= size {
            return Ok(0);
        }
        let mut cursor = offset as usize;
        let end = size.min(offset.saturating_add(length)) as usize;
        let mut read = 0u64;
        for segment in segments.iter_mut() {
            if cursor >= end {
                break;
            }
            let n = segment.len().min(end - cursor);
            segment[..n].copy_from_slice(&object.data[cursor..cursor + n]);
            cursor += n;
            read += n as u64;
        }
        Ok(read)
    }

    async fn create_metadata(
        &self,
        cache_id: &str,
        link: &ObjectId,
        record: MetadataRecord,
    ) -> StorageResult<ObjectMetadata> {
        let id = self
            .create_object(CreateRequest {
                cache_id: cache_id.to_string(),
                metadata: Some(record.with("link", link.as_str())),
                link: Some(link.clone()),
            })
            .await?;
        self.close(&id).await
    }

    async fn read_metadata(&self, id: &ObjectId) -> StorageResult<MetadataRecord> {
        let object = self
            .objects
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        object.check_readable(id)?;
        Ok(object.metadata.clone().unwrap_or_default())
    }
}

//! Storage coordinator interface.
//!
//! # Data Flow
//! ```text
//! store handler
//!     → create_object (pending id, not yet durable)
//!     → write_data * n  ─┐
//!     → commit (fail-safe boundaries)
//!     → close → ObjectMetadata
//!
//! retrieve handler
//!     → read_data * n (segment lists, offset, length)
//! ```
//!
//! # Design Decisions
//! - The coordinator owns concurrency control on an object being written
//! - `commit` covers everything written so far, so repeating it is harmless
//! - Metadata records are parsed by the coordinator in the request encoding

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::http::context::WireEncoding;

pub use memory::MemoryStorage;

/// Identifier of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse an identifier supplied by a client.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(StorageError::InvalidArgument(format!(
                "invalid object id '{}'",
                raw
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata returned once an object is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub id: ObjectId,
    pub size: u64,
    pub created: DateTime<Utc>,
    /// SHA-256 of the content, lowercase hex.
    pub content_hash: String,
    /// Whether the object's metadata is already visible to queries.
    pub query_ready: bool,
}

/// Named string fields attached to an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord {
    pub fields: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Decode a record in the given wire encoding.
    ///
    /// `Legacy` is `name=value` lines, `Structured` is a flat JSON object.
    pub fn decode(raw: &[u8], encoding: WireEncoding) -> Result<Self, StorageError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| StorageError::InvalidArgument("metadata is not UTF-8".to_string()))?;
        match encoding {
            WireEncoding::Legacy => {
                let mut record = Self::new();
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (name, value) = line.split_once('=').ok_or_else(|| {
                        StorageError::InvalidArgument(format!("malformed metadata line '{}'", line))
                    })?;
                    record.fields.insert(name.trim().to_string(), value.trim().to_string());
                }
                Ok(record)
            }
            WireEncoding::Structured => serde_json::from_str(text)
                .map_err(|e| StorageError::InvalidArgument(format!("malformed metadata: {}", e))),
        }
    }

    /// Encode the record in the given wire encoding.
    pub fn encode(&self, encoding: WireEncoding) -> Vec<u8> {
        match encoding {
            WireEncoding::Legacy => {
                let mut out = String::new();
                for (name, value) in &self.fields {
                    out.push_str(name);
                    out.push('=');
                    out.push_str(value);
                    out.push('\n');
                }
                out.into_bytes()
            }
            WireEncoding::Structured => serde_json::to_vec(&self.fields).unwrap_or_default(),
        }
    }
}

/// Parameters for creating a pending object.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Namespace the object is created in.
    pub cache_id: String,
    /// Metadata supplied atomically with creation (store-both).
    pub metadata: Option<MetadataRecord>,
    /// Object this one describes (metadata-only objects).
    pub link: Option<ObjectId>,
}

/// Errors raised by the storage coordinator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No such object.
    #[error("object {0} not found")]
    NotFound(String),

    /// Object was lost and cannot be rebuilt.
    #[error("object {0} is gone")]
    Gone(String),

    /// A segment of the object failed its integrity check.
    #[error("object {0} is corrupted")]
    Corrupted(String),

    /// Caller passed something nonsensical.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not enough replicas / segments to satisfy the durability policy.
    #[error("durability requirement not met: {0}")]
    Durability(String),

    /// Object is in the wrong state for the operation.
    #[error("object {id} is {state}")]
    InvalidState { id: String, state: &'static str },

    /// Underlying device failure.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The erasure-coded storage engine as seen by the protocol layer.
#[async_trait]
pub trait StorageCoordinator: Send + Sync {
    /// Create a pending object and return its identifier immediately.
    async fn create_object(&self, request: CreateRequest) -> StorageResult<ObjectId>;

    /// Write `data` at `offset`. `is_last` marks the final write of the stream.
    async fn write_data(
        &self,
        id: &ObjectId,
        data: &[u8],
        offset: u64,
        is_last: bool,
    ) -> StorageResult<()>;

    /// Make everything written so far durable.
    async fn commit(&self, id: &ObjectId, flush: bool) -> StorageResult<()>;

    /// Finish the object and return its metadata.
    async fn close(&self, id: &ObjectId) -> StorageResult<ObjectMetadata>;

    /// Fill `segments` in order starting at `offset`, reading at most `length`
    /// bytes. Returns the number of bytes read; fewer than requested means the
    /// end of the object was reached.
    async fn read_data(
        &self,
        id: &ObjectId,
        segments: &mut [&mut [u8]],
        offset: u64,
        length: u64,
        is_last_read: bool,
    ) -> StorageResult<u64>;

    /// Parse a metadata record supplied by a client.
    fn parse_metadata(
        &self,
        cache_id: &str,
        raw: &[u8],
        encoding: WireEncoding,
    ) -> StorageResult<MetadataRecord> {
        let _ = cache_id;
        MetadataRecord::decode(raw, encoding)
    }

    /// Create a metadata-only object describing `link`.
    async fn create_metadata(
        &self,
        cache_id: &str,
        link: &ObjectId,
        record: MetadataRecord,
    ) -> StorageResult<ObjectMetadata>;

    /// Load the metadata record of an object.
    async fn read_metadata(&self, id: &ObjectId) -> StorageResult<MetadataRecord>;
}

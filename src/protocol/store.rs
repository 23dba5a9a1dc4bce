//! Store protocol: streamed uploads with optional fail-safe commits.
//!
//! # Data Flow
//! ```text
//! POST /store | /store-both | /store-metadata
//!     → CreateStrategy  (pending object, with metadata, or a link target)
//!     → WriteStrategy   (buffer loop with chunk commits, or one record)
//!     → close → object metadata envelope (201)
//! ```
//!
//! In fail-safe mode (`x-chunk-size` > 0) every crossed chunk boundary
//! produces one storage commit and one `"<hex index>\n"` line on the open
//! response. A client that saw the line for chunk `k` may assume the first
//! `k * chunk_size` bytes are durable. Chunks are numbered from 1; a partial
//! tail is only made durable by the final close.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use bytes::BytesMut;

use crate::http::context::RequestContext;
use crate::http::request::{ProtocolRequest, X_CHUNK_SIZE, X_METADATA_LENGTH};
use crate::http::response::ProtocolResponse;
use crate::observability::metrics;
use crate::protocol::envelope::EnvelopeFormat;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::lifecycle::ProtocolHandler;
use crate::protocol::ProtocolServices;
use crate::storage::{CreateRequest, ObjectId, ObjectMetadata};

/// Commit bookkeeping of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCommitState {
    total_bytes_written: u64,
    chunk_size: u64,
    chunks_committed: u64,
}

impl ChunkCommitState {
    /// `chunk_size == 0` disables fail-safe mode.
    pub fn new(chunk_size: u64) -> Self {
        Self {
            total_bytes_written: 0,
            chunk_size,
            chunks_committed: 0,
        }
    }

    pub fn is_fail_safe(&self) -> bool {
        self.chunk_size > 0
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Complete chunks written so far.
    pub fn chunks_written(&self) -> u64 {
        if self.chunk_size == 0 {
            0
        } else {
            self.total_bytes_written / self.chunk_size
        }
    }

    pub fn chunks_committed(&self) -> u64 {
        self.chunks_committed
    }

    /// Account for `bytes` more and return the chunk indexes now owed a commit.
    pub fn record_write(&mut self, bytes: u64) -> RangeInclusive<u64> {
        self.total_bytes_written += bytes;
        (self.chunks_committed + 1)..=self.chunks_written()
    }

    /// Record that chunk `index` is durable.
    pub fn mark_committed(&mut self, index: u64) {
        debug_assert_eq!(index, self.chunks_committed + 1);
        self.chunks_committed = index.min(self.chunks_written());
    }
}

/// What the upload is attached to once created.
#[derive(Debug)]
enum Target {
    Pending(ObjectId),
    Link(ObjectId),
}

/// How the object is created before any payload is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStrategy {
    /// Pending object without metadata.
    DataOnly,
    /// Metadata record of `x-metadata-length` bytes heads the body and is
    /// supplied atomically with creation.
    WithMetadata,
    /// No pending object; the body describes the object named by `link`.
    LinkedMetadata,
}

impl CreateStrategy {
    async fn create(
        &self,
        services: &ProtocolServices,
        ctx: &RequestContext,
        request: &mut ProtocolRequest,
        cache_id: &str,
    ) -> ProtocolResult<Target> {
        match self {
            CreateStrategy::DataOnly => {
                let id = services
                    .storage
                    .create_object(CreateRequest {
                        cache_id: cache_id.to_string(),
                        ..Default::default()
                    })
                    .await?;
                Ok(Target::Pending(id))
            }
            CreateStrategy::WithMetadata => {
                let len: usize = request
                    .header_str(&X_METADATA_LENGTH)
                    .ok_or_else(|| {
                        ProtocolError::BadRequest("x-metadata-length is required".to_string())
                    })?
                    .trim()
                    .parse()
                    .map_err(|_| {
                        ProtocolError::BadRequest("x-metadata-length is not a number".to_string())
                    })?;
                if len > services.config.max_envelope_bytes {
                    return Err(ProtocolError::BadRequest(format!(
                        "metadata section of {} bytes exceeds {}",
                        len, services.config.max_envelope_bytes
                    )));
                }
                let raw = request.body_mut().read_exact(len).await.map_err(|e| {
                    match e.kind() {
                        std::io::ErrorKind::UnexpectedEof => ProtocolError::BadRequest(
                            "body ended inside the metadata section".to_string(),
                        ),
                        _ => ProtocolError::Transport(e),
                    }
                })?;
                let record = services
                    .storage
                    .parse_metadata(cache_id, &raw, ctx.encoding)?;
                let id = services
                    .storage
                    .create_object(CreateRequest {
                        cache_id: cache_id.to_string(),
                        metadata: Some(record),
                        link: None,
                    })
                    .await?;
                Ok(Target::Pending(id))
            }
            CreateStrategy::LinkedMetadata => {
                let link = request
                    .param("link")
                    .ok_or_else(|| ProtocolError::BadRequest("link parameter is required".into()))?;
                Ok(Target::Link(ObjectId::parse(link)?))
            }
        }
    }
}

/// How the body reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Buffer loop into the pending object, fail-safe commits when enabled.
    Stream,
    /// Whole body is one metadata record for the linked object.
    Record,
}

/// Result of the write phase.
struct Stored {
    metadata: ObjectMetadata,
    bytes: u64,
    commits: u64,
    storage_time: Duration,
}

impl WriteStrategy {
    async fn write(
        &self,
        services: &ProtocolServices,
        ctx: &RequestContext,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
        cache_id: &str,
        target: Target,
    ) -> ProtocolResult<Stored> {
        match (self, target) {
            (WriteStrategy::Stream, Target::Pending(id)) => {
                stream_upload(services, request, response, &id).await
            }
            (WriteStrategy::Record, Target::Link(link)) => {
                let raw = request
                    .body_mut()
                    .read_to_end(services.config.max_envelope_bytes)
                    .await
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::InvalidData => {
                            ProtocolError::BadRequest("metadata record too large".to_string())
                        }
                        _ => ProtocolError::Transport(e),
                    })?;
                let started = Instant::now();
                let record = services
                    .storage
                    .parse_metadata(cache_id, &raw, ctx.encoding)?;
                let metadata = services
                    .storage
                    .create_metadata(cache_id, &link, record)
                    .await?;
                Ok(Stored {
                    metadata,
                    bytes: raw.len() as u64,
                    commits: 0,
                    storage_time: started.elapsed(),
                })
            }
            (strategy, target) => Err(ProtocolError::internal(format!(
                "write strategy {:?} cannot handle {:?}",
                strategy, target
            ))),
        }
    }
}

fn chunk_size(services: &ProtocolServices, request: &ProtocolRequest) -> ProtocolResult<u64> {
    match request.header_str(&X_CHUNK_SIZE) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadRequest(format!("invalid chunk size '{}'", raw))),
        None => Ok(services.config.default_chunk_size),
    }
}

async fn stream_upload(
    services: &ProtocolServices,
    request: &mut ProtocolRequest,
    response: &mut ProtocolResponse,
    id: &ObjectId,
) -> ProtocolResult<Stored> {
    let storage = &services.storage;
    let mut state = ChunkCommitState::new(chunk_size(services, request)?);
    let mut buf = services.pool.checkout();
    let mut offset = 0u64;
    let mut storage_time = Duration::ZERO;
    let mut commits = 0u64;

    tracing::debug!(
        object_id = %id,
        chunk_size = state.chunk_size(),
        fail_safe = state.is_fail_safe(),
        "Upload started"
    );

    loop {
        let n = request.body_mut().read_full(&mut buf).await?;
        let is_last = n < buf.len();

        let started = Instant::now();
        storage.write_data(id, &buf[..n], offset, is_last).await?;
        storage_time += started.elapsed();
        offset += n as u64;

        if state.is_fail_safe() {
            for index in state.record_write(n as u64) {
                let started = Instant::now();
                storage.commit(id, true).await?;
                storage_time += started.elapsed();
                state.mark_committed(index);
                commits += 1;
                metrics::record_store_commit();
                response.write(format!("{:x}\n", index).into()).await?;
                tracing::trace!(object_id = %id, chunk = index, "Chunk committed");
            }
        } else {
            state.record_write(n as u64);
        }

        if is_last {
            break;
        }
    }

    let started = Instant::now();
    let metadata = storage.close(id).await?;
    storage_time += started.elapsed();

    tracing::debug!(
        object_id = %id,
        bytes = state.total_bytes_written(),
        chunks_committed = state.chunks_committed(),
        "Upload closed"
    );

    Ok(Stored {
        metadata,
        bytes: state.total_bytes_written(),
        commits,
        storage_time,
    })
}

/// One store pipeline, configured by its create and write strategies.
pub struct StoreHandler {
    name: &'static str,
    create: CreateStrategy,
    write: WriteStrategy,
    services: ProtocolServices,
}

impl StoreHandler {
    pub fn new(
        name: &'static str,
        create: CreateStrategy,
        write: WriteStrategy,
        services: ProtocolServices,
    ) -> Self {
        Self {
            name,
            create,
            write,
            services,
        }
    }

    /// `POST /store`: data only.
    pub fn data(services: ProtocolServices) -> Self {
        Self::new("store", CreateStrategy::DataOnly, WriteStrategy::Stream, services)
    }

    /// `POST /store-both`: metadata section, then data.
    pub fn both(services: ProtocolServices) -> Self {
        Self::new(
            "store-both",
            CreateStrategy::WithMetadata,
            WriteStrategy::Stream,
            services,
        )
    }

    /// `POST /store-metadata?link=<id>`: metadata for an existing object.
    pub fn metadata(services: ProtocolServices) -> Self {
        Self::new(
            "store-metadata",
            CreateStrategy::LinkedMetadata,
            WriteStrategy::Record,
            services,
        )
    }
}

#[async_trait]
impl ProtocolHandler for StoreHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<()> {
        let cache_id = request
            .param("cache")
            .unwrap_or(self.services.config.default_cache.as_str())
            .to_string();
        let format = EnvelopeFormat::from_binary_flag(request.param_flag("binary"));

        response.set_status(StatusCode::CREATED);
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(format.content_type()),
        );

        let target = self
            .create
            .create(&self.services, ctx, request, &cache_id)
            .await?;
        let stored = self
            .write
            .write(&self.services, ctx, request, response, &cache_id, target)
            .await?;

        let mut out = BytesMut::new();
        format.encode_object(&mut out, &stored.metadata)?;
        response.write(out.freeze()).await?;

        self.services
            .stats
            .store
            .record(stored.bytes, stored.commits, stored.storage_time);
        metrics::record_store_bytes(stored.bytes);
        tracing::info!(
            object_id = %stored.metadata.id,
            size = stored.metadata.size,
            commits = stored.commits,
            "Object stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_support::{run, services_with};
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::Method;
    use futures_util::stream;
    use rand::Rng;
    use std::sync::Arc;

    fn split_body(data: Vec<u8>, cuts: Vec<usize>) -> Body {
        let mut chunks = Vec::new();
        let mut start = 0;
        for cut in cuts {
            chunks.push(bytes::Bytes::copy_from_slice(&data[start..cut]));
            start = cut;
        }
        chunks.push(bytes::Bytes::copy_from_slice(&data[start..]));
        Body::from_stream(stream::iter(
            chunks.into_iter().map(Ok::<_, std::io::Error>),
        ))
    }

    fn acks(body: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(body)
            .lines()
            .take_while(|line| {
                !line.is_empty()
                    && line.len() < 16
                    && line.chars().all(|c| c.is_ascii_hexdigit())
            })
            .map(String::from)
            .collect()
    }

    #[test]
    fn commit_state_tracks_boundaries() {
        let mut state = ChunkCommitState::new(1000);
        assert!(state.record_write(999).is_empty());
        let owed: Vec<_> = state.record_write(1501).collect();
        assert_eq!(owed, vec![1, 2]);
        for index in owed {
            state.mark_committed(index);
        }
        assert_eq!(state.chunks_committed(), 2);
        assert!(state.record_write(499).is_empty());
        assert_eq!(state.chunks_written(), 2);

        let mut disabled = ChunkCommitState::new(0);
        assert!(disabled.record_write(10_000).is_empty());
        assert_eq!(disabled.chunks_written(), 0);
    }

    #[tokio::test]
    async fn fail_safe_upload_acknowledges_complete_chunks() {
        let storage = Arc::new(MemoryStorage::new());
        let services = services_with(Arc::clone(&storage), 256);
        let request = ProtocolRequest::new(
            Method::POST,
            "/store?binary=true",
            Body::from(vec![7u8; 2500]),
        )
        .with_header("x-chunk-size", "1000");

        let res = run(&StoreHandler::data(services), request).await;
        assert_eq!(res.status, Some(StatusCode::CREATED));
        assert_eq!(acks(&res.body), vec!["1", "2"]);

        let envelope = &res.body[ack_prefix_len(&res.body)..];
        let meta = EnvelopeFormat::Binary.decode_object(envelope).unwrap();
        assert_eq!(meta.size, 2500);
        assert_eq!(storage.commit_count(&meta.id), Some(2));
    }

    #[tokio::test]
    async fn acknowledgments_are_hex() {
        let storage = Arc::new(MemoryStorage::new());
        let services = services_with(Arc::clone(&storage), 512);
        let request = ProtocolRequest::new(Method::POST, "/store", Body::from(vec![1u8; 1100]))
            .with_header("x-chunk-size", "100");
        let res = run(&StoreHandler::data(services), request).await;
        let lines = acks(&res.body);
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[9], "a");
        assert_eq!(lines[10], "b");
    }

    #[tokio::test]
    async fn commits_do_not_depend_on_write_split() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let total: usize = rng.gen_range(0..5000);
            let chunk: u64 = rng.gen_range(1..700);
            let buffer: usize = rng.gen_range(512..1024);
            let mut cuts: Vec<usize> = (0..rng.gen_range(0..8))
                .map(|_| rng.gen_range(0..=total))
                .collect();
            cuts.sort_unstable();

            let storage = Arc::new(MemoryStorage::new());
            let services = services_with(Arc::clone(&storage), buffer);
            let request = ProtocolRequest::new(
                Method::POST,
                "/store?binary=1",
                split_body(vec![3u8; total], cuts),
            )
            .with_header("x-chunk-size", chunk.to_string());
            let res = run(&StoreHandler::data(services), request).await;
            assert_eq!(res.status, Some(StatusCode::CREATED));

            let expected = total as u64 / chunk;
            assert_eq!(acks(&res.body).len() as u64, expected);
            let meta = EnvelopeFormat::Binary
                .decode_object(&res.body[ack_prefix_len(&res.body)..])
                .unwrap();
            assert_eq!(meta.size, total as u64);
            assert_eq!(storage.commit_count(&meta.id), Some(expected));
        }
    }

    fn ack_prefix_len(body: &[u8]) -> usize {
        acks(body).iter().map(|line| line.len() + 1).sum()
    }

    #[tokio::test]
    async fn non_fail_safe_upload_has_no_acknowledgments() {
        let storage = Arc::new(MemoryStorage::new());
        let services = services_with(Arc::clone(&storage), 512);
        let request = ProtocolRequest::new(Method::POST, "/store", Body::from(vec![9u8; 3000]));
        let res = run(&StoreHandler::data(services), request).await;
        assert_eq!(res.status, Some(StatusCode::CREATED));
        let meta = EnvelopeFormat::Xml.decode_object(&res.body).unwrap();
        assert_eq!(meta.size, 3000);
        assert_eq!(storage.commit_count(&meta.id), Some(0));
    }

    #[tokio::test]
    async fn store_both_attaches_metadata_at_creation() {
        let storage = Arc::new(MemoryStorage::new());
        let services = services_with(Arc::clone(&storage), 512);
        let record = b"color=red\nsize=small\n";
        let mut body = record.to_vec();
        body.extend_from_slice(b"object payload");
        let request = ProtocolRequest::new(Method::POST, "/store-both?cache=pics", Body::from(body))
            .with_header("x-metadata-length", record.len().to_string());
        let res = run(&StoreHandler::both(services), request).await;
        assert_eq!(res.status, Some(StatusCode::CREATED), "{}", res.body_text());

        let meta = EnvelopeFormat::Xml.decode_object(&res.body).unwrap();
        assert_eq!(meta.size, 14);
        assert!(meta.query_ready);
        let indexed = storage.indexed_objects("pics");
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].1.get("color"), Some("red"));
    }

    #[tokio::test]
    async fn store_both_requires_metadata_length() {
        let services = services_with(Arc::new(MemoryStorage::new()), 512);
        let request = ProtocolRequest::new(Method::POST, "/store-both", Body::from("abc"));
        let res = run(&StoreHandler::both(services), request).await;
        assert_eq!(res.status, Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn store_metadata_links_existing_object() {
        let storage = Arc::new(MemoryStorage::new());
        let target = storage.insert_object("default", b"data", None);
        let services = services_with(Arc::clone(&storage), 512);
        let request = ProtocolRequest::new(
            Method::POST,
            &format!("/store-metadata?link={}", target.id),
            Body::from(r#"{"owner":"ops"}"#),
        )
        .with_header("x-protocol-version", "3.0");
        let res = run(&StoreHandler::metadata(services), request).await;
        assert_eq!(res.status, Some(StatusCode::CREATED), "{}", res.body_text());

        let meta = EnvelopeFormat::Xml.decode_object(&res.body).unwrap();
        let (_, record) = storage
            .indexed_objects("default")
            .into_iter()
            .find(|(id, _)| *id == meta.id)
            .unwrap();
        assert_eq!(record.get("owner"), Some("ops"));
        assert_eq!(record.get("link"), Some(target.id.as_str()));
    }

    #[tokio::test]
    async fn store_metadata_for_missing_link_is_404() {
        let services = services_with(Arc::new(MemoryStorage::new()), 512);
        let request = ProtocolRequest::new(
            Method::POST,
            "/store-metadata?link=feedface",
            Body::from("a=b"),
        );
        let res = run(&StoreHandler::metadata(services), request).await;
        assert_eq!(res.status, Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn write_failure_after_acks_goes_to_trailer() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_writes_past(1500);
        let services = services_with(Arc::clone(&storage), 512);
        let request = ProtocolRequest::new(Method::POST, "/store", Body::from(vec![0u8; 4000]))
            .with_header("x-chunk-size", "1000")
            .with_header("te", "trailers");
        let res = run(&StoreHandler::data(services), request).await;
        assert_eq!(res.status, Some(StatusCode::CREATED));
        assert_eq!(acks(&res.body), vec!["1"]);
        assert_eq!(res.trailer("x-error-status"), Some("500"));
    }

    #[tokio::test]
    async fn durability_failure_before_any_ack_is_412() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_commits(true);
        let services = services_with(Arc::clone(&storage), 512);
        let request = ProtocolRequest::new(Method::POST, "/store", Body::from(vec![0u8; 1500]))
            .with_header("x-chunk-size", "1000");
        let res = run(&StoreHandler::data(services), request).await;
        assert_eq!(res.status, Some(StatusCode::PRECONDITION_FAILED));
    }

    #[tokio::test]
    async fn malformed_chunk_size_is_rejected() {
        let services = services_with(Arc::new(MemoryStorage::new()), 512);
        let request = ProtocolRequest::new(Method::POST, "/store", Body::from("x"))
            .with_header("x-chunk-size", "lots");
        let res = run(&StoreHandler::data(services), request).await;
        assert_eq!(res.status, Some(StatusCode::BAD_REQUEST));
    }
}

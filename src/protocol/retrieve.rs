//! Retrieve protocol: ranged object reads and metadata reads.
//!
//! # Data Flow
//! ```text
//! GET /retrieve/{id}  [Range: first-[last]]
//!     → parse_range → 200 or 206 + content-range
//!     → loop: read_data(segments) → write each filled segment
//!     → stop on short read or once the range is satisfied
//!
//! GET /retrieve-metadata/{id}
//!     → read_metadata → record in the negotiated encoding
//! ```
//!
//! Storage time and network time are accounted separately so a slow client
//! does not look like a slow disk.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use bytes::Bytes;

use crate::http::context::RequestContext;
use crate::http::range::parse_range;
use crate::http::request::ProtocolRequest;
use crate::http::response::ProtocolResponse;
use crate::observability::metrics;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::lifecycle::ProtocolHandler;
use crate::protocol::ProtocolServices;
use crate::storage::ObjectId;

fn object_id(request: &ProtocolRequest, prefix: &str) -> ProtocolResult<ObjectId> {
    let raw = request
        .path_tail(prefix)
        .ok_or_else(|| ProtocolError::BadRequest("object id is required".to_string()))?;
    Ok(ObjectId::parse(raw)?)
}

/// `GET /retrieve/{id}`.
pub struct RetrieveHandler {
    services: ProtocolServices,
}

impl RetrieveHandler {
    pub fn new(services: ProtocolServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ProtocolHandler for RetrieveHandler {
    fn name(&self) -> &'static str {
        "retrieve"
    }

    async fn handle(
        &self,
        _ctx: &RequestContext,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<()> {
        let id = object_id(request, "/retrieve")?;
        let range = parse_range(request.header_str(&header::RANGE))?;

        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        if range.is_partial() {
            response.set_status(StatusCode::PARTIAL_CONTENT);
            if let Some(content_range) = range.content_range() {
                response.set_header(header::CONTENT_RANGE, &content_range);
            }
        }

        let storage = &self.services.storage;
        let mut segments = self
            .services
            .pool
            .checkout_many(self.services.config.read_segments.max(1));
        let capacity: u64 = segments.iter().map(|s| s.len() as u64).sum();

        let mut offset = range.offset;
        let mut remaining = range.length;
        let mut total = 0u64;
        let mut storage_time = Duration::ZERO;
        let mut network_time = Duration::ZERO;

        loop {
            let want = remaining.map_or(capacity, |r| r.min(capacity));
            if want == 0 {
                break;
            }
            let is_last_read = remaining.is_some_and(|r| r <= capacity);

            let started = Instant::now();
            let read = {
                let mut slices: Vec<&mut [u8]> = segments.iter_mut().map(|s| &mut s[..]).collect();
                storage
                    .read_data(&id, &mut slices, offset, want, is_last_read)
                    .await?
            };
            storage_time += started.elapsed();
            if read == 0 {
                break;
            }

            let started = Instant::now();
            let mut left = read as usize;
            for segment in segments.iter() {
                if left == 0 {
                    break;
                }
                let n = segment.len().min(left);
                response.write(Bytes::copy_from_slice(&segment[..n])).await?;
                left -= n;
            }
            network_time += started.elapsed();

            offset += read;
            total += read;
            if let Some(r) = remaining.as_mut() {
                *r -= read;
            }
            if read < want {
                break;
            }
        }

        // Zero-length results still owe the client a head.
        response.commit().await?;

        self.services
            .stats
            .retrieve
            .record(total, storage_time, network_time);
        metrics::record_retrieve_bytes("data", total);
        tracing::debug!(
            object_id = %id,
            offset = range.offset,
            bytes = total,
            storage_ms = storage_time.as_millis() as u64,
            network_ms = network_time.as_millis() as u64,
            "Object retrieved"
        );
        Ok(())
    }
}

/// `GET /retrieve-metadata/{id}`.
pub struct RetrieveMetadataHandler {
    services: ProtocolServices,
}

impl RetrieveMetadataHandler {
    pub fn new(services: ProtocolServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ProtocolHandler for RetrieveMetadataHandler {
    fn name(&self) -> &'static str {
        "retrieve-metadata"
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<()> {
        let id = object_id(request, "/retrieve-metadata")?;

        let started = Instant::now();
        let record = self.services.storage.read_metadata(&id).await?;
        let storage_time = started.elapsed();

        let body = record.encode(ctx.encoding);
        let len = body.len() as u64;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(ctx.encoding.content_type()),
        );

        let started = Instant::now();
        response.write(body.into()).await?;
        let network_time = started.elapsed();

        self.services
            .stats
            .retrieve_metadata
            .record(len, storage_time, network_time);
        metrics::record_retrieve_bytes("metadata", len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_support::{run, services_with};
    use crate::storage::{MemoryStorage, MetadataRecord};
    use axum::body::Body;
    use axum::http::Method;
    use std::sync::Arc;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn get(path: &str) -> ProtocolRequest {
        ProtocolRequest::new(Method::GET, path, Body::empty())
    }

    #[tokio::test]
    async fn full_object_is_200() {
        let storage = Arc::new(MemoryStorage::new());
        let data = payload(10_000);
        let meta = storage.insert_object("c", &data, None);
        let services = services_with(Arc::clone(&storage), 1024);
        let stats = Arc::clone(&services.stats);

        let res = run(
            &RetrieveHandler::new(services),
            get(&format!("/retrieve/{}", meta.id)),
        )
        .await;
        assert_eq!(res.status, Some(StatusCode::OK));
        assert_eq!(res.body, data);
        assert!(res.header("content-range").is_none());
        assert_eq!(stats.snapshot().retrieve.bytes, 10_000);
    }

    #[tokio::test]
    async fn bounded_range_is_206_with_exact_bytes() {
        let storage = Arc::new(MemoryStorage::new());
        let data = payload(10_000);
        let meta = storage.insert_object("c", &data, None);
        let services = services_with(Arc::clone(&storage), 1024);

        let request = get(&format!("/retrieve/{}", meta.id)).with_header("range", "bytes=100-5099");
        let res = run(&RetrieveHandler::new(services), request).await;
        assert_eq!(res.status, Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(res.header("content-range"), Some("bytes 100-5099/*"));
        assert_eq!(res.body, &data[100..5100]);
    }

    #[tokio::test]
    async fn open_range_reads_to_end() {
        let storage = Arc::new(MemoryStorage::new());
        let data = payload(3000);
        let meta = storage.insert_object("c", &data, None);
        let services = services_with(Arc::clone(&storage), 512);

        let request = get(&format!("/retrieve/{}", meta.id)).with_header("range", "2500-");
        let res = run(&RetrieveHandler::new(services), request).await;
        assert_eq!(res.status, Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(res.body, &data[2500..]);
    }

    #[tokio::test]
    async fn range_past_end_is_truncated() {
        let storage = Arc::new(MemoryStorage::new());
        let data = payload(100);
        let meta = storage.insert_object("c", &data, None);
        let services = services_with(Arc::clone(&storage), 512);

        let request = get(&format!("/retrieve/{}", meta.id)).with_header("range", "50-999");
        let res = run(&RetrieveHandler::new(services), request).await;
        assert_eq!(res.body, &data[50..]);
    }

    #[tokio::test]
    async fn invalid_range_is_400() {
        let storage = Arc::new(MemoryStorage::new());
        let meta = storage.insert_object("c", b"abc", None);
        let services = services_with(Arc::clone(&storage), 512);
        let request = get(&format!("/retrieve/{}", meta.id)).with_header("range", "9-3");
        let res = run(&RetrieveHandler::new(services), request).await;
        assert_eq!(res.status, Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn missing_gone_and_corrupted_objects() {
        let storage = Arc::new(MemoryStorage::new());
        let gone = storage.insert_object("c", b"abc", None);
        storage.mark_gone(&gone.id);
        let corrupted = storage.insert_object("c", b"abc", None);
        storage.mark_corrupted(&corrupted.id);
        let services = services_with(Arc::clone(&storage), 512);
        let handler = RetrieveHandler::new(services);

        let res = run(&handler, get("/retrieve/0123abcd")).await;
        assert_eq!(res.status, Some(StatusCode::NOT_FOUND));
        let res = run(&handler, get(&format!("/retrieve/{}", gone.id))).await;
        assert_eq!(res.status, Some(StatusCode::GONE));
        let res = run(&handler, get(&format!("/retrieve/{}", corrupted.id))).await;
        assert_eq!(res.status, Some(StatusCode::FAILED_DEPENDENCY));
    }

    #[tokio::test]
    async fn metadata_follows_negotiated_encoding() {
        let storage = Arc::new(MemoryStorage::new());
        let meta = storage.insert_object(
            "c",
            b"abc",
            Some(MetadataRecord::new().with("color", "blue")),
        );
        let services = services_with(Arc::clone(&storage), 512);
        let stats = Arc::clone(&services.stats);
        let handler = RetrieveMetadataHandler::new(services);
        let path = format!("/retrieve-metadata/{}", meta.id);

        let res = run(&handler, get(&path)).await;
        assert_eq!(res.body_text(), "color=blue\n");

        let res = run(&handler, get(&path).with_header("x-protocol-version", "2.5")).await;
        assert_eq!(res.body_text(), r#"{"color":"blue"}"#);
        assert_eq!(res.header("content-type"), Some("application/json"));

        let snap = stats.snapshot();
        assert_eq!(snap.retrieve_metadata.requests, 2);
        assert_eq!(snap.retrieve.requests, 0);
    }
}

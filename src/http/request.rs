//! Request side of the protocol engine.
//!
//! # Responsibilities
//! - Expose parameters, header fields and the declared HTTP version
//! - Offer the request body as a pull-based byte stream
//! - Name every protocol header in one place

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use axum::body::{Body, BodyDataStream};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Version};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;

/// Client-declared protocol version (`major.minor`).
pub const X_PROTOCOL_VERSION: HeaderName = HeaderName::from_static("x-protocol-version");
/// Client family, drives the trailer-support assumption.
pub const X_CLIENT_AGENT: HeaderName = HeaderName::from_static("x-client-agent");
/// Fail-safe chunk size for store requests.
pub const X_CHUNK_SIZE: HeaderName = HeaderName::from_static("x-chunk-size");
/// Length of the metadata section heading a store-both body.
pub const X_METADATA_LENGTH: HeaderName = HeaderName::from_static("x-metadata-length");
/// Hex continuation cookie of a query.
pub const X_QUERY_COOKIE: HeaderName = HeaderName::from_static("x-query-cookie");
/// Cluster configuration generation the client already holds.
pub const X_CONFIG_GENERATION: HeaderName = HeaderName::from_static("x-config-generation");
/// Client supplied log tag.
pub const X_LOG_TAG: HeaderName = HeaderName::from_static("x-log-tag");
/// Request id set by the tower-http layer.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Response: node that served the request.
pub const X_NODE_ID: HeaderName = HeaderName::from_static("x-node-id");
/// Response: handler the request was dispatched to.
pub const X_DISPATCH_TARGET: HeaderName = HeaderName::from_static("x-dispatch-target");
/// Response: length of the config blob heading the body.
pub const X_CONFIG_BLOB_LENGTH: HeaderName = HeaderName::from_static("x-config-blob-length");
/// Response header and trailer: error reason.
pub const X_ERROR_REASON: HeaderName = HeaderName::from_static("x-error-reason");
/// Trailer: numeric error status.
pub const X_ERROR_STATUS: HeaderName = HeaderName::from_static("x-error-status");

/// Pull-based reader over an incoming body.
pub struct RequestBody {
    stream: BodyDataStream,
    pending: Bytes,
    exhausted: bool,
    consumed: u64,
}

impl RequestBody {
    pub fn new(body: Body) -> Self {
        Self {
            stream: body.into_data_stream(),
            pending: Bytes::new(),
            exhausted: false,
            consumed: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(Body::empty())
    }

    /// Total bytes handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Read whatever is available, up to `dst.len()`. `Ok(0)` means end of body.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            if self.exhausted {
                return Ok(0);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => return Err(io::Error::other(e)),
                None => self.exhausted = true,
            }
        }
        let n = dst.len().min(self.pending.len());
        dst[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.consumed += n as u64;
        Ok(n)
    }

    /// Fill `dst` completely unless the body ends first; short reads are retried.
    pub async fn read_full(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.read(&mut dst[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> io::Result<Bytes> {
        let mut buf = vec![0u8; len];
        let n = self.read_full(&mut buf).await?;
        if n < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended after {} of {} bytes", n, len),
            ));
        }
        Ok(Bytes::from(buf))
    }

    /// Read the rest of the body, refusing more than `limit` bytes.
    pub async fn read_to_end(&mut self, limit: usize) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        let mut chunk = [0u8; 8 * 1024];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out.freeze());
            }
            if out.len() + n > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("body exceeds {} bytes", limit),
                ));
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

/// A request as seen by protocol handlers.
pub struct ProtocolRequest {
    method: Method,
    path: String,
    params: HashMap<String, String>,
    headers: HeaderMap,
    version: Version,
    remote_addr: Option<SocketAddr>,
    body: RequestBody,
}

impl ProtocolRequest {
    /// Build from an axum request.
    pub fn from_http(request: Request<Body>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = request.into_parts();
        let params = parts
            .uri
            .query()
            .map(parse_params)
            .unwrap_or_default();
        Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            params,
            headers: parts.headers,
            version: parts.version,
            remote_addr,
            body: RequestBody::new(body),
        }
    }

    /// Build directly, mostly for tests and internal dispatch.
    pub fn new(method: Method, path_and_query: &str, body: Body) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        Self {
            method,
            path: path.to_string(),
            params: query.map(parse_params).unwrap_or_default(),
            headers: HeaderMap::new(),
            version: Version::HTTP_11,
            remote_addr: None,
            body: RequestBody::new(body),
        }
    }

    /// Add a header (builder style). Invalid values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_ref()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path remainder after `prefix`, without leading slashes.
    pub fn path_tail(&self, prefix: &str) -> Option<&str> {
        self.path
            .strip_prefix(prefix)
            .map(|tail| tail.trim_start_matches('/'))
            .filter(|tail| !tail.is_empty())
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Boolean query flag: present and not `false`/`0`/`no`.
    pub fn param_flag(&self, name: &str) -> bool {
        match self.param(name) {
            Some(v) => !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"),
            None => false,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Declared client family: `x-client-agent`, falling back to `user-agent`.
    pub fn agent(&self) -> Option<&str> {
        self.header_str(&X_CLIENT_AGENT)
            .or_else(|| self.header_str(&header::USER_AGENT))
    }

    /// Whether the request advertised `TE: trailers`.
    pub fn accepts_trailers(&self) -> bool {
        self.headers.get_all(header::TE).iter().any(|value| {
            value
                .to_str()
                .map(|v| {
                    v.split(',')
                        .any(|part| part.trim().eq_ignore_ascii_case("trailers"))
                })
                .unwrap_or(false)
        })
    }

    /// Whether the body is declared as XML.
    pub fn has_xml_body(&self) -> bool {
        self.header_str(&header::CONTENT_TYPE)
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.starts_with("text/xml") || ct.starts_with("application/xml")
            })
            .unwrap_or(false)
    }
}

fn parse_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunked_body(chunks: Vec<&'static [u8]>) -> Body {
        Body::from_stream(stream::iter(
            chunks.into_iter().map(|c| Ok::<_, io::Error>(Bytes::from_static(c))),
        ))
    }

    #[tokio::test]
    async fn read_full_retries_short_reads() {
        let mut body = RequestBody::new(chunked_body(vec![b"ab", b"c", b"defg"]));
        let mut buf = [0u8; 5];
        assert_eq!(body.read_full(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        assert_eq!(body.read_full(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"fg");
        assert_eq!(body.read_full(&mut buf).await.unwrap(), 0);
        assert_eq!(body.consumed(), 7);
    }

    #[tokio::test]
    async fn read_exact_reports_truncation() {
        let mut body = RequestBody::new(Body::from("abc"));
        let err = body.read_exact(10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_to_end_enforces_limit() {
        let mut body = RequestBody::new(Body::from(vec![1u8; 100]));
        assert!(body.read_to_end(10).await.is_err());
    }

    #[test]
    fn params_and_path_tail() {
        let req = ProtocolRequest::new(
            Method::GET,
            "/retrieve/abc?binary=true&q=a%3Db",
            Body::empty(),
        );
        assert_eq!(req.path_tail("/retrieve"), Some("abc"));
        assert_eq!(req.param("q"), Some("a=b"));
        assert!(req.param_flag("binary"));
        assert!(!req.param_flag("trace"));
    }

    #[test]
    fn trailer_and_agent_detection() {
        let req = ProtocolRequest::new(Method::GET, "/", Body::empty())
            .with_header("te", "gzip, trailers")
            .with_header("user-agent", "curl/8.0");
        assert!(req.accepts_trailers());
        assert_eq!(req.agent(), Some("curl/8.0"));

        let req = req.with_header("x-client-agent", "LegacySDK/1.2");
        assert_eq!(req.agent(), Some("LegacySDK/1.2"));
    }
}

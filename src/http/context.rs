//! Per-request context.
//!
//! Built by the lifecycle before delegating to a handler, passed down by
//! reference, and dropped when the request finishes. Nothing here outlives
//! the request or crosses into another request's task.

use std::fmt;

use bytes::Bytes;

use crate::protocol::envelope::QueryEnvelope;
use crate::protocol::error::{ProtocolError, ProtocolResult};

/// Protocol version a client declares in `x-protocol-version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientVersion {
    pub major: u16,
    pub minor: u16,
}

impl ClientVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parse `major.minor` (a bare `major` means `major.0`).
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let raw = raw.trim();
        let (major, minor) = match raw.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (raw, "0"),
        };
        let parse = |s: &str| {
            s.trim().parse::<u16>().map_err(|_| {
                ProtocolError::BadRequest(format!("malformed protocol version '{}'", raw))
            })
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Serialization used for metadata records on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireEncoding {
    /// `name=value` lines, spoken by clients older than the threshold.
    #[default]
    Legacy,
    /// Flat JSON objects.
    Structured,
}

impl WireEncoding {
    /// Pick the encoding for a declared client version.
    ///
    /// Selection is a threshold comparison; clients that declare nothing get
    /// the legacy encoding.
    pub fn negotiate(declared: Option<ClientVersion>, threshold: ClientVersion) -> Self {
        match declared {
            Some(version) if version >= threshold => Self::Structured,
            _ => Self::Legacy,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Legacy => "text/plain; charset=utf-8",
            Self::Structured => "application/json",
        }
    }
}

/// Values scoped to a single request.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Encoding negotiated from the client's version header.
    pub encoding: WireEncoding,
    /// Tag attached to every log line of this request.
    pub log_tag: String,
    /// Host the client addressed.
    pub requested_host: Option<String>,
    /// Configuration delta owed to the client ahead of any body byte.
    pending_config_blob: Option<Bytes>,
    /// Query parsed from an XML request body.
    pub query_envelope: Option<QueryEnvelope>,
}

impl RequestContext {
    pub fn new(log_tag: impl Into<String>) -> Self {
        Self {
            log_tag: log_tag.into(),
            ..Default::default()
        }
    }

    /// Record the blob the client must receive first.
    pub fn set_config_blob(&mut self, blob: Bytes) {
        self.pending_config_blob = Some(blob);
    }

    /// Length of the pending blob, if any.
    pub fn config_blob_len(&self) -> Option<usize> {
        self.pending_config_blob.as_ref().map(Bytes::len)
    }

    /// Hand the blob over to whoever writes it. Subsequent calls return `None`.
    pub fn take_config_blob(&mut self) -> Option<Bytes> {
        self.pending_config_blob.take()
    }
}

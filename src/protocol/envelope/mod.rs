//! Response envelopes and the XML query envelope.
//!
//! # Responsibilities
//! - Serialize query results and object metadata in binary or XML form
//! - Decode both forms again (CLI, integration tests)
//! - Parse the XML query envelope a client may send instead of parameters
//!
//! # Design Decisions
//! - Both formats implement one [`EnvelopeWriter`] so the logical envelope
//!   (hits, count, cookie, integrity time) cannot drift between them
//! - Writers append to a caller-owned `BytesMut`; the handler decides when
//!   the bytes go out, which is what makes deferred opening possible
//! - Cookies travel hex-encoded in both formats

pub mod binary;
pub mod xml;

use std::collections::BTreeMap;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::query::Hit;
use crate::storage::ObjectMetadata;

pub use xml::parse_query_envelope;

/// Serialization of a response envelope, chosen by the `binary` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    Binary,
    Xml,
}

impl EnvelopeFormat {
    pub fn from_binary_flag(binary: bool) -> Self {
        if binary {
            Self::Binary
        } else {
            Self::Xml
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Binary => "application/octet-stream",
            Self::Xml => "text/xml; charset=utf-8",
        }
    }

    /// A fresh query-result writer for this format.
    pub fn query_writer(&self) -> Box<dyn EnvelopeWriter> {
        match self {
            Self::Binary => Box::new(binary::BinaryEnvelopeWriter),
            Self::Xml => Box::new(xml::XmlEnvelopeWriter),
        }
    }

    /// Serialize the metadata of a stored object.
    pub fn encode_object(&self, out: &mut BytesMut, meta: &ObjectMetadata) -> EnvelopeResult<()> {
        match self {
            Self::Binary => {
                binary::encode_object(out, meta);
                Ok(())
            }
            Self::Xml => xml::encode_object(out, meta),
        }
    }

    pub fn decode_object(&self, raw: &[u8]) -> EnvelopeResult<ObjectMetadata> {
        match self {
            Self::Binary => binary::decode_object(raw),
            Self::Xml => xml::decode_object(raw),
        }
    }

    pub fn decode_query_result(&self, raw: &[u8]) -> EnvelopeResult<QueryResultEnvelope> {
        match self {
            Self::Binary => binary::decode_query_result(raw),
            Self::Xml => xml::decode_query_result(raw),
        }
    }
}

/// Envelope encoding and decoding failures.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("XML error: {0}")]
    Xml(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// A query submitted as an XML request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryEnvelope {
    pub cache: Option<String>,
    pub text: Option<String>,
    pub params: BTreeMap<String, String>,
    pub select: Vec<String>,
    pub key: Option<String>,
    pub cookie: Option<Vec<u8>>,
    pub max_results: Option<u32>,
}

/// Terminal fields of a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTerminal {
    pub count: u64,
    pub cookie: Option<Vec<u8>>,
    pub integrity_time: DateTime<Utc>,
}

/// A decoded query-result envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResultEnvelope {
    pub hits: Vec<Hit>,
    pub terminal: QueryTerminal,
}

/// Incremental writer of a query-result envelope.
///
/// Call order is `open`, `hit` * n, `close`.
pub trait EnvelopeWriter: Send {
    fn open(&mut self, out: &mut BytesMut) -> EnvelopeResult<()>;
    fn hit(&mut self, out: &mut BytesMut, hit: &Hit) -> EnvelopeResult<()>;
    fn close(&mut self, out: &mut BytesMut, terminal: &QueryTerminal) -> EnvelopeResult<()>;
}

/// Hex form of a cookie as written on the wire.
pub fn encode_cookie(cookie: &[u8]) -> String {
    hex::encode(cookie)
}

/// Parse a hex cookie coming from a client.
pub fn decode_cookie(raw: &str) -> EnvelopeResult<Vec<u8>> {
    hex::decode(raw.trim()).map_err(|_| EnvelopeError::Malformed("cookie is not hex".to_string()))
}

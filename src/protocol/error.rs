//! Protocol failure taxonomy.
//!
//! Concrete handlers only ever return a [`ProtocolError`]; the lifecycle is
//! the single place that maps a variant to a status code and picks the
//! header / trailer / abort reporting path.

use axum::http::StatusCode;
use thiserror::Error;

use crate::http::range::RangeError;
use crate::protocol::envelope::EnvelopeError;
use crate::query::QueryError;
use crate::storage::StorageError;

/// Errors a protocol handler can report to the client.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Object or property absent.
    #[error("{0}")]
    NotFound(String),

    /// Object existed but is now unrecoverable.
    #[error("{0}")]
    Gone(String),

    /// Object exists but a required part is corrupted.
    #[error("{0}")]
    FailedDependency(String),

    /// Malformed input, bad range, bad argument.
    #[error("{0}")]
    BadRequest(String),

    /// A durability requirement could not be met.
    #[error("{0}")]
    PreconditionFailed(String),

    /// Unexpected server-side fault.
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Client speaks an HTTP version older than the minimum.
    #[error("HTTP version {0} not supported")]
    UnsupportedVersion(String),

    /// The node is not accepting requests right now.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The client connection died under us. Never reportable.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result type for protocol handlers.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    /// Internal error with no underlying cause.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Internal error wrapping a cause, kept for the diagnostic chain.
    pub fn internal_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// HTTP status carried by this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::FailedDependency(_) => StatusCode::FAILED_DEPENDENCY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::Internal { .. } | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnsupportedVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short reason string returned to the client.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// True for failures that are our fault and deserve a full server-side log.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Render the error and every source below it, one per line.
    pub fn diagnostic_chain(&self) -> String {
        let mut out = self.to_string();
        let mut current = std::error::Error::source(self);
        while let Some(cause) = current {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            current = cause.source();
        }
        out
    }
}

impl From<StorageError> for ProtocolError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => Self::NotFound(format!("object {} not found", id)),
            StorageError::Gone(id) => Self::Gone(format!("object {} is no longer recoverable", id)),
            StorageError::Corrupted(id) => {
                Self::FailedDependency(format!("object {} has a corrupted segment", id))
            }
            StorageError::InvalidArgument(msg) => Self::BadRequest(msg),
            StorageError::Durability(msg) => Self::PreconditionFailed(msg),
            other => Self::internal_from("storage failure", other),
        }
    }
}

impl From<QueryError> for ProtocolError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidQuery(msg) => Self::BadRequest(msg),
            QueryError::InvalidCookie => Self::BadRequest("invalid query cookie".to_string()),
            other => Self::internal_from("query failure", other),
        }
    }
}

impl From<RangeError> for ProtocolError {
    fn from(err: RangeError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<EnvelopeError> for ProtocolError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Io(e) => Self::Transport(e),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

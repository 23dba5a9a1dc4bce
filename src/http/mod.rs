//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (hyper HTTP/1)
//!     → server.rs (Axum routes, request ID, trace layer, task spawn)
//!     → request.rs (params, headers, version, pull-based body)
//!     → [protocol lifecycle + handler]
//!     → response.rs (held head, config-blob prefix, chunked body, trailers)
//!     → Send to client
//! ```
//!
//! `context.rs` holds the per-request values handlers read, `range.rs` the
//! byte-range grammar of retrieve requests.

pub mod context;
pub mod range;
pub mod request;
pub mod response;
pub mod server;

pub use context::{ClientVersion, RequestContext, WireEncoding};
pub use request::{ProtocolRequest, X_REQUEST_ID};
pub use response::{ProtocolResponse, ResponseHandle};
pub use server::GatewayServer;

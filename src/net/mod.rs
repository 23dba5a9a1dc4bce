//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listening ports (one listener each)
//!     → acceptor.rs (shared wait set, socket tuning, rebuild on empty polls)
//!     → connection.rs (idle timeout, HTTP/1 serving, explicit close)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded worker pool (semaphore) prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Sockets are closed by us, not by hyper, so close semantics stay explicit

pub mod acceptor;
pub mod connection;

pub use acceptor::{AcceptedSocket, AcceptorError, MultiPortAcceptor};
pub use connection::{serve_connection, ConnectionGuard, ConnectionId, ConnectionTracker};

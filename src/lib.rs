//! Object storage gateway.
//!
//! The protocol layer between object-storage clients and a storage cluster:
//! it accepts HTTP/1 connections on several ports, runs each request through
//! one lifecycle (readiness, version negotiation, cluster config delivery,
//! error signalling) and dispatches to store, retrieve and query handlers.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net (multi-port acceptor, idle timeout)
//!                 │
//!                 ▼
//!               http (axum routes, request/response adapters)
//!                 │
//!                 ▼
//!               protocol (lifecycle → store / retrieve / query / stats)
//!                 │
//!                 ▼
//!               storage + query (coordinator and engine traits)
//!
//!     Cross-cutting: config (gateway + cluster), observability, lifecycle
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod protocol;

// Backends
pub mod query;
pub mod storage;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::{GatewayNode, Shutdown};

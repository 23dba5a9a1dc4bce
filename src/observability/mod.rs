//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, per-request spans)
//!     → metrics.rs (counters, gauges, histograms)
//!     → stats.rs (in-process accumulators behind GET /stats)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Operators and tests reading /stats
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Log tag flows through every span of a request
//! - Metrics and stats are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod stats;

pub use stats::ProtocolStats;

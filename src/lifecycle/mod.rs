//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load cluster config → Wire services → Bind ports → Accepting
//!
//! Readiness (readiness.rs):
//!     local accepting flag ∧ cluster accepting flag → 503 or serve
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Not accepting → Stop accept loop → Drain → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Drain has a deadline: connections still open after it are abandoned

pub mod readiness;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use readiness::ServiceState;
pub use shutdown::Shutdown;
pub use startup::{build_runtime, run, GatewayNode, StartupError};

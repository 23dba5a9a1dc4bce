//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gateway.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! cluster.toml
//!     → cluster.rs (generation, accepting flag, raw blob)
//!     → ClusterState (ArcSwap)
//!
//! On change:
//!     watcher.rs detects change
//!     → cluster.rs reloads
//!     → atomic swap of Arc<ClusterConfig>
//!     → next request sees the new generation
//! ```
//!
//! # Design Decisions
//! - Gateway config is immutable once loaded; only the cluster file reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod cluster;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use cluster::{ClusterConfig, ClusterState};
pub use loader::{load_config, ConfigError};
pub use schema::{
    GatewayConfig, ListenerConfig, LogFormat, NodeConfig, ObservabilityConfig, ProtocolConfig,
    RuntimeConfig,
};

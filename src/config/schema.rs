//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::http::context::ClientVersion;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listening ports and acceptor tuning.
    pub listener: ListenerConfig,

    /// Tokio runtime sizing.
    pub runtime: RuntimeConfig,

    /// Protocol handler settings.
    pub protocol: ProtocolConfig,

    /// Identity of this node within the cluster.
    pub node: NodeConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host every port is bound on.
    pub bind_host: String,

    /// Ports to listen on; `0` asks the OS for an ephemeral port.
    pub ports: Vec<u16>,

    /// How long one acceptor poll waits for a ready listener.
    pub poll_timeout_ms: u64,

    /// Consecutive empty polls after which the wait set is rebuilt.
    pub rebuild_after_empty_polls: u32,

    /// Idle time after which a connection is closed under its handler.
    pub idle_timeout_secs: u64,

    /// Maximum concurrently served connections (worker pool size).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            ports: vec![8080, 8079],
            poll_timeout_ms: 500,
            rebuild_after_empty_polls: 10,
            idle_timeout_secs: 120,
            max_connections: 1024,
        }
    }
}

/// Tokio runtime sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; `None` uses one per core.
    pub worker_threads: Option<usize>,

    /// Upper bound on the blocking thread pool.
    pub max_blocking_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_blocking_threads: 512,
        }
    }
}

/// Protocol handler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol version announced in `x-protocol-version`.
    pub version: String,

    /// Size of one I/O buffer in bytes.
    pub buffer_size: usize,

    /// Buffers filled per storage read on retrieve.
    pub read_segments: usize,

    /// Body frames buffered between a handler and the socket.
    pub response_frames: usize,

    /// Returned buffers kept for reuse.
    pub buffer_pool_idle: usize,

    /// Fail-safe chunk size used when the client sends none; `0` disables.
    pub default_chunk_size: u64,

    /// Cache (namespace) used when a request names none.
    pub default_cache: String,

    /// Client agent prefixes known not to read HTTP trailers.
    pub legacy_agents: Vec<String>,

    /// Lowest client version that gets the structured encoding.
    pub structured_encoding_version: String,

    /// Cap on buffered request bodies (XML envelopes, metadata sections).
    pub max_envelope_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: "3.0".to_string(),
            buffer_size: 64 * 1024,
            read_segments: 4,
            response_frames: 16,
            buffer_pool_idle: 256,
            default_chunk_size: 0,
            default_cache: "default".to_string(),
            legacy_agents: vec!["LegacySDK".to_string()],
            structured_encoding_version: "2.5".to_string(),
            max_envelope_bytes: 1024 * 1024,
        }
    }
}

impl ProtocolConfig {
    /// Parsed form of `structured_encoding_version`. Validation guarantees it
    /// parses; the fallback only covers configs built in code.
    pub fn structured_threshold(&self) -> ClientVersion {
        ClientVersion::parse(&self.structured_encoding_version)
            .unwrap_or(ClientVersion::new(2, 5))
    }

    /// Whether an agent string belongs to a client family without trailer support.
    pub fn is_legacy_agent(&self, agent: &str) -> bool {
        self.legacy_agents
            .iter()
            .any(|prefix| !prefix.is_empty() && agent.starts_with(prefix.as_str()))
    }
}

/// Node identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name reported in `x-node-id` and in trailer reasons.
    pub id: String,

    /// Cluster configuration file, watched for changes.
    pub cluster_config_path: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            cluster_config_path: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub log_level: String,

    /// Human-readable or JSON lines.
    pub log_format: LogFormat,

    /// Expose a Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Address of the scrape endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "object_gateway=info,tower_http=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

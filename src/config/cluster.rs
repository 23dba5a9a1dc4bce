//! Cluster ("multicell") configuration.
//!
//! The cluster file is TOML with a `generation` counter and an `accepting`
//! flag. Its raw bytes are the blob shipped to clients whose declared
//! generation is behind ours.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::Deserialize;

use crate::config::loader::ConfigError;

#[derive(Debug, Deserialize)]
struct ClusterFile {
    generation: u64,
    #[serde(default = "default_accepting")]
    accepting: bool,
}

fn default_accepting() -> bool {
    true
}

/// One generation of the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub generation: u64,
    /// Whether the cluster lets this node take requests.
    pub accepting: bool,
    /// Exact file contents, delivered to stale clients.
    pub blob: Bytes,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            generation: 0,
            accepting: true,
            blob: Bytes::new(),
        }
    }
}

impl ClusterConfig {
    pub fn parse(raw: &[u8]) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(raw).map_err(|e| {
            ConfigError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let file: ClusterFile = toml::from_str(text).map_err(ConfigError::Parse)?;
        Ok(Self {
            generation: file.generation,
            accepting: file.accepting,
            blob: Bytes::copy_from_slice(raw),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(ConfigError::Io)?;
        Self::parse(&raw)
    }
}

/// Current cluster configuration, swapped atomically on reload.
#[derive(Debug, Default)]
pub struct ClusterState {
    current: ArcSwap<ClusterConfig>,
}

impl ClusterState {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(config),
        })
    }

    pub fn current(&self) -> Arc<ClusterConfig> {
        self.current.load_full()
    }

    pub fn replace(&self, config: ClusterConfig) {
        let previous = self.current.swap(Arc::new(config));
        tracing::info!(
            previous = previous.generation,
            current = self.current.load().generation,
            "Cluster configuration replaced"
        );
    }

    /// Blob owed to a client holding `client_generation`, if it is stale.
    pub fn blob_for(&self, client_generation: u64) -> Option<Bytes> {
        let current = self.current.load();
        if current.blob.is_empty() || client_generation >= current.generation {
            return None;
        }
        Some(current.blob.clone())
    }
}

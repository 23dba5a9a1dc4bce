//! Protocol handlers subsystem.
//!
//! # Data Flow
//! ```text
//! ProtocolRequest
//!     → lifecycle.rs (version, readiness, context, error protocol)
//!     → store.rs | retrieve.rs | query.rs | stats_handler.rs
//!     → envelope/ (binary or XML response envelopes)
//!     → ProtocolResponse
//! ```
//!
//! # Design Decisions
//! - Handlers share one [`ProtocolServices`] bundle of cheap `Arc` clones
//! - Buffers come from one pool per node, never allocated per request
//! - Handlers only return errors; reporting them is the lifecycle's job

pub mod buffer_pool;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod query;
pub mod retrieve;
pub mod stats_handler;
pub mod store;

use std::sync::Arc;

use crate::config::ProtocolConfig;
use crate::observability::ProtocolStats;
use crate::query::QueryEngine;
use crate::storage::StorageCoordinator;

pub use buffer_pool::BufferPool;
pub use error::{ProtocolError, ProtocolResult};
pub use lifecycle::{Outcome, ProtocolHandler, ReadinessProbe, RequestLifecycle};

/// Collaborators every handler needs.
#[derive(Clone)]
pub struct ProtocolServices {
    pub storage: Arc<dyn StorageCoordinator>,
    pub query: Arc<dyn QueryEngine>,
    pub pool: Arc<BufferPool>,
    pub stats: Arc<ProtocolStats>,
    pub config: Arc<ProtocolConfig>,
}

impl ProtocolServices {
    pub fn new(
        config: &ProtocolConfig,
        storage: Arc<dyn StorageCoordinator>,
        query: Arc<dyn QueryEngine>,
        stats: Arc<ProtocolStats>,
    ) -> Self {
        Self {
            storage,
            query,
            pool: BufferPool::new(config.buffer_size, config.buffer_pool_idle),
            stats,
            config: Arc::new(config.clone()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{ClusterConfig, ClusterState, GatewayConfig};
    use crate::http::request::ProtocolRequest;
    use crate::http::response::{CollectedResponse, ProtocolResponse};
    use crate::query::MemoryQueryEngine;
    use crate::storage::MemoryStorage;

    struct AlwaysReady;

    impl ReadinessProbe for AlwaysReady {
        fn is_accepting(&self) -> bool {
            true
        }
    }

    /// Services over in-memory collaborators with a pool of `buffer_size` buffers.
    pub fn services_with(storage: Arc<MemoryStorage>, buffer_size: usize) -> ProtocolServices {
        let config = ProtocolConfig {
            buffer_size,
            ..Default::default()
        };
        let query = Arc::new(MemoryQueryEngine::new(Arc::clone(&storage)));
        ProtocolServices::new(&config, storage, query, Arc::new(ProtocolStats::default()))
    }

    /// Drive `request` through a full lifecycle and collect the response.
    pub async fn run(
        handler: &dyn ProtocolHandler,
        mut request: ProtocolRequest,
    ) -> CollectedResponse {
        let config = GatewayConfig::default();
        let lifecycle = RequestLifecycle::new(
            &config,
            Arc::new(AlwaysReady),
            ClusterState::new(ClusterConfig::default()),
            Arc::new(ProtocolStats::default()),
        );
        let (mut response, handle) = ProtocolResponse::channel(8);
        let serve = async move {
            lifecycle.handle(handler, &mut request, &mut response).await;
            drop(response);
        };
        let ((), collected) = tokio::join!(serve, handle.collect());
        collected
    }
}

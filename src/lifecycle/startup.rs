//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the Tokio runtime from configuration
//! - Load the cluster configuration and start its watcher
//! - Initialize subsystems in dependency order
//! - Bind listeners, then flip the node to accepting
//! - Tie OS signals to graceful shutdown
//!
//! # Design Decisions
//! - Fail fast: bind and cluster-load errors are fatal
//! - A missing or broken watcher is not fatal; the loaded generation stays
//! - Listeners bind before readiness turns on (traffic only when ready)

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use notify::RecommendedWatcher;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;

use crate::config::watcher::ClusterConfigWatcher;
use crate::config::{ClusterConfig, ClusterState, ConfigError, GatewayConfig, RuntimeConfig};
use crate::http::GatewayServer;
use crate::lifecycle::readiness::ServiceState;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals;
use crate::net::{AcceptorError, MultiPortAcceptor};
use crate::observability::{metrics, ProtocolStats};
use crate::protocol::{ProtocolServices, ReadinessProbe, RequestLifecycle};
use crate::query::{MemoryQueryEngine, QueryEngine};
use crate::storage::{MemoryStorage, StorageCoordinator};

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cluster configuration: {0}")]
    Cluster(#[from] ConfigError),

    #[error(transparent)]
    Acceptor(#[from] AcceptorError),

    #[error("server: {0}")]
    Io(#[from] io::Error),
}

/// Build the multi-threaded runtime sized by `config`.
pub fn build_runtime(config: &RuntimeConfig) -> io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("gateway-worker")
        .max_blocking_threads(config.max_blocking_threads.max(1));
    if let Some(threads) = config.worker_threads {
        builder.worker_threads(threads.max(1));
    }
    builder.build()
}

/// A fully wired node whose listeners are bound but not yet served.
pub struct GatewayNode {
    server: GatewayServer,
    acceptor: MultiPortAcceptor,
    readiness: Arc<ServiceState>,
    stats: Arc<ProtocolStats>,
}

impl GatewayNode {
    /// Wire the protocol stack over the given backends and bind every port.
    pub fn build(
        config: &GatewayConfig,
        cluster: Arc<ClusterState>,
        storage: Arc<dyn StorageCoordinator>,
        query: Arc<dyn QueryEngine>,
    ) -> Result<Self, StartupError> {
        let stats = Arc::new(ProtocolStats::default());
        let services = ProtocolServices::new(&config.protocol, storage, query, Arc::clone(&stats));
        let readiness = ServiceState::new(Arc::clone(&cluster));
        let lifecycle = Arc::new(RequestLifecycle::new(
            config,
            Arc::clone(&readiness) as Arc<dyn ReadinessProbe>,
            cluster,
            Arc::clone(&stats),
        ));
        let server = GatewayServer::new(config, lifecycle, services);
        let acceptor = MultiPortAcceptor::bind(&config.listener)?.with_stats(Arc::clone(&stats));

        Ok(Self {
            server,
            acceptor,
            readiness,
            stats,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        self.acceptor.local_addrs()
    }

    pub fn readiness(&self) -> Arc<ServiceState> {
        Arc::clone(&self.readiness)
    }

    pub fn stats(&self) -> Arc<ProtocolStats> {
        Arc::clone(&self.stats)
    }

    /// Accept traffic until `shutdown` fires, then drain.
    pub async fn serve(self, shutdown: broadcast::Receiver<()>) -> io::Result<()> {
        self.readiness.set_accepting(true);
        let result = self.server.run(self.acceptor, shutdown).await;
        self.readiness.set_accepting(false);
        result
    }
}

/// Run a node with in-memory backends until SIGINT or SIGTERM.
pub async fn run(config: GatewayConfig) -> Result<(), StartupError> {
    tracing::info!(
        node_id = %config.node.id,
        ports = ?config.listener.ports,
        protocol_version = %config.protocol.version,
        "Gateway node starting"
    );

    let (cluster, _watcher) = start_cluster(config.node.cluster_config_path.as_deref())?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let storage = Arc::new(MemoryStorage::new());
    let query = Arc::new(MemoryQueryEngine::new(Arc::clone(&storage)));
    let node = GatewayNode::build(&config, cluster, storage, query)?;

    let shutdown = Arc::new(Shutdown::new());
    let receiver = shutdown.subscribe();
    let readiness = node.readiness();
    let trigger = Arc::clone(&shutdown);
    tokio::spawn(async move {
        match signals::wait_for_signal().await {
            Ok(signal) => {
                tracing::info!(?signal, "Shutdown signal received");
                readiness.set_accepting(false);
                trigger.trigger();
            }
            Err(e) => tracing::error!(error = %e, "Cannot listen for shutdown signals"),
        }
    });

    node.serve(receiver).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Load the cluster file, if any, and keep it reloading.
fn start_cluster(
    path: Option<&str>,
) -> Result<(Arc<ClusterState>, Option<RecommendedWatcher>), StartupError> {
    let Some(path) = path.map(Path::new) else {
        tracing::info!("No cluster configuration, using generation 0");
        return Ok((ClusterState::new(ClusterConfig::default()), None));
    };

    let initial = ClusterConfig::load(path)?;
    tracing::info!(generation = initial.generation, path = ?path, "Cluster configuration loaded");
    let cluster = ClusterState::new(initial);

    let (watcher, mut generations) = ClusterConfigWatcher::new(path, Arc::clone(&cluster));
    let watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Cluster config watcher unavailable, reloads disabled");
            None
        }
    };
    tokio::spawn(async move {
        while let Some(generation) = generations.recv().await {
            tracing::info!(generation, "Cluster configuration generation installed");
        }
    });

    Ok((cluster, watcher))
}

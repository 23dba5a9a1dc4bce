//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use object_gateway::config::{ClusterConfig, ClusterState, GatewayConfig, ListenerConfig};
use object_gateway::lifecycle::{GatewayNode, ServiceState, Shutdown};
use object_gateway::observability::ProtocolStats;
use object_gateway::protocol::ReadinessProbe;
use object_gateway::query::MemoryQueryEngine;
use object_gateway::storage::MemoryStorage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// A gateway node serving in-memory backends on loopback.
pub struct TestNode {
    pub addrs: Vec<SocketAddr>,
    pub storage: Arc<MemoryStorage>,
    pub query: Arc<MemoryQueryEngine>,
    pub cluster: Arc<ClusterState>,
    pub readiness: Arc<ServiceState>,
    pub stats: Arc<ProtocolStats>,
    shutdown: Shutdown,
    task: JoinHandle<io::Result<()>>,
}

/// Config bound to ephemeral loopback ports with small I/O buffers.
pub fn test_config(ports: usize) -> GatewayConfig {
    let mut config = GatewayConfig {
        listener: ListenerConfig {
            bind_host: "127.0.0.1".to_string(),
            ports: vec![0; ports],
            poll_timeout_ms: 20,
            idle_timeout_secs: 5,
            ..Default::default()
        },
        ..Default::default()
    };
    config.protocol.buffer_size = 1024;
    config
}

impl TestNode {
    pub async fn start() -> Self {
        Self::start_with(test_config(1), ClusterConfig::default()).await
    }

    pub async fn start_with(config: GatewayConfig, cluster: ClusterConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let query = Arc::new(MemoryQueryEngine::new(Arc::clone(&storage)));
        let cluster = ClusterState::new(cluster);
        let node = GatewayNode::build(
            &config,
            Arc::clone(&cluster),
            storage.clone(),
            query.clone(),
        )
        .expect("node builds");

        let addrs = node.local_addrs().to_vec();
        let readiness = node.readiness();
        let stats = node.stats();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(node.serve(shutdown.subscribe()));

        // Wait for the serve loop to flip readiness on.
        for _ in 0..100 {
            if readiness.is_accepting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        Self {
            addrs,
            storage,
            query,
            cluster,
            readiness,
            stats,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addrs[0], path)
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.task
            .await
            .expect("server task")
            .expect("server stops cleanly");
    }
}

/// Send a raw HTTP/1.1 request and read until the server closes.
///
/// Returns whatever arrived, even when the connection was reset.
pub async fn raw_exchange(addr: SocketAddr, head: &str, body: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(head.as_bytes()).await.expect("write head");
    stream.write_all(body).await.expect("write body");

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
        }
    }
    received
}

/// Hex acknowledgment lines at the front of a store response body.
pub fn acknowledgments(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .take_while(|line| {
            !line.is_empty() && line.len() < 16 && line.chars().all(|c| c.is_ascii_hexdigit())
        })
        .map(String::from)
        .collect()
}

/// Body of a store response with its acknowledgment lines removed.
pub fn strip_acknowledgments(body: &[u8]) -> &[u8] {
    let skip: usize = acknowledgments(body).iter().map(|l| l.len() + 1).sum();
    &body[skip..]
}

/// Poll `check` until it holds or a second passes.
///
/// Outcomes are recorded after the last byte goes out, so a client can see
/// the full response slightly before the counters move.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// HTTP client that does not keep idle connections, so shutdown drains fast.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .expect("client builds")
}

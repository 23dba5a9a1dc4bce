//! Node readiness.
//!
//! A node takes requests only while both hold: startup has finished and
//! shutdown has not begun, and the current cluster configuration marks the
//! node as accepting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ClusterState;
use crate::protocol::ReadinessProbe;

pub struct ServiceState {
    accepting: AtomicBool,
    cluster: Arc<ClusterState>,
}

impl ServiceState {
    /// Starts out not accepting.
    pub fn new(cluster: Arc<ClusterState>) -> Arc<Self> {
        Arc::new(Self {
            accepting: AtomicBool::new(false),
            cluster,
        })
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
        tracing::info!(accepting, "Node readiness changed");
    }
}

impl ReadinessProbe for ServiceState {
    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.cluster.current().accepting
    }
}

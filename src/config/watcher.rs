//! Cluster configuration watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::cluster::{ClusterConfig, ClusterState};

/// A watcher that monitors the cluster configuration file for changes.
pub struct ClusterConfigWatcher {
    path: PathBuf,
    state: Arc<ClusterState>,
    update_tx: mpsc::UnboundedSender<u64>,
}

impl ClusterConfigWatcher {
    /// Create a new watcher feeding `state`.
    ///
    /// Returns the watcher and a receiver of newly installed generations.
    pub fn new(path: &Path, state: Arc<ClusterState>) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                state,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();
        let state = self.state;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Cluster config change detected, reloading...");
                        match ClusterConfig::load(&path) {
                            Ok(config) => {
                                let generation = config.generation;
                                state.replace(config);
                                let _ = tx.send(generation);
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Failed to reload cluster config: {}. Keeping current configuration.",
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Cluster config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rewrites_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(&path, "generation = 1\n").unwrap();

        let state = ClusterState::new(ClusterConfig::load(&path).unwrap());
        let (watcher, mut updates) = ClusterConfigWatcher::new(&path, Arc::clone(&state));
        let _guard = watcher.run().unwrap();

        std::fs::write(&path, "generation = 2\n").unwrap();
        let generation = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match updates.recv().await {
                    Some(2) | None => break state.current().generation,
                    Some(_) => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(generation, 2);
    }
}

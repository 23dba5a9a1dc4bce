//! In-process statistics accumulators.
//!
//! Many request tasks update these concurrently; every counter is a relaxed
//! atomic, so writers never block each other. [`ProtocolStats::snapshot`]
//! gives a serializable copy for `GET /stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::protocol::lifecycle::Outcome;

fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Store counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    requests: AtomicU64,
    bytes: AtomicU64,
    commits: AtomicU64,
    storage_nanos: AtomicU64,
}

impl StoreStats {
    pub fn record(&self, bytes: u64, commits: u64, storage_time: Duration) {
        add(&self.requests, 1);
        add(&self.bytes, bytes);
        add(&self.commits, commits);
        add(&self.storage_nanos, nanos(storage_time));
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            requests: get(&self.requests),
            bytes: get(&self.bytes),
            commits: get(&self.commits),
            storage_millis: get(&self.storage_nanos) / 1_000_000,
        }
    }
}

/// Retrieve counters; storage and network time are kept apart.
#[derive(Debug, Default)]
pub struct RetrieveStats {
    requests: AtomicU64,
    bytes: AtomicU64,
    storage_nanos: AtomicU64,
    network_nanos: AtomicU64,
}

impl RetrieveStats {
    pub fn record(&self, bytes: u64, storage_time: Duration, network_time: Duration) {
        add(&self.requests, 1);
        add(&self.bytes, bytes);
        add(&self.storage_nanos, nanos(storage_time));
        add(&self.network_nanos, nanos(network_time));
    }

    fn snapshot(&self) -> RetrieveSnapshot {
        let bytes = get(&self.bytes);
        let storage_nanos = get(&self.storage_nanos);
        RetrieveSnapshot {
            requests: get(&self.requests),
            bytes,
            storage_millis: storage_nanos / 1_000_000,
            network_millis: get(&self.network_nanos) / 1_000_000,
            storage_bytes_per_sec: if storage_nanos == 0 {
                0
            } else {
                (bytes as u128 * 1_000_000_000 / storage_nanos as u128) as u64
            },
        }
    }
}

/// Query counters.
#[derive(Debug, Default)]
pub struct QueryStats {
    requests: AtomicU64,
    hits: AtomicU64,
    continued: AtomicU64,
}

impl QueryStats {
    pub fn record(&self, hits: u64, has_cookie: bool) {
        add(&self.requests, 1);
        add(&self.hits, hits);
        if has_cookie {
            add(&self.continued, 1);
        }
    }

    fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            requests: get(&self.requests),
            hits: get(&self.hits),
            pages_with_cookie: get(&self.continued),
        }
    }
}

/// Terminal request outcomes.
#[derive(Debug, Default)]
pub struct OutcomeStats {
    ok: AtomicU64,
    error_header: AtomicU64,
    error_trailer: AtomicU64,
    aborted: AtomicU64,
}

impl OutcomeStats {
    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Ok => &self.ok,
            Outcome::ErrorHeader => &self.error_header,
            Outcome::ErrorTrailer => &self.error_trailer,
            Outcome::Aborted => &self.aborted,
        };
        add(counter, 1);
    }

    fn snapshot(&self) -> OutcomeSnapshot {
        OutcomeSnapshot {
            ok: get(&self.ok),
            error_header: get(&self.error_header),
            error_trailer: get(&self.error_trailer),
            aborted: get(&self.aborted),
        }
    }
}

/// All protocol counters of one node.
#[derive(Debug, Default)]
pub struct ProtocolStats {
    pub store: StoreStats,
    pub retrieve: RetrieveStats,
    pub retrieve_metadata: RetrieveStats,
    pub query: QueryStats,
    pub outcomes: OutcomeStats,
    acceptor_rebuilds: AtomicU64,
}

impl ProtocolStats {
    pub fn record_acceptor_rebuild(&self) {
        add(&self.acceptor_rebuilds, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            store: self.store.snapshot(),
            retrieve: self.retrieve.snapshot(),
            retrieve_metadata: self.retrieve_metadata.snapshot(),
            query: self.query.snapshot(),
            outcomes: self.outcomes.snapshot(),
            acceptor_rebuilds: get(&self.acceptor_rebuilds),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub requests: u64,
    pub bytes: u64,
    pub commits: u64,
    pub storage_millis: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RetrieveSnapshot {
    pub requests: u64,
    pub bytes: u64,
    pub storage_millis: u64,
    pub network_millis: u64,
    pub storage_bytes_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuerySnapshot {
    pub requests: u64,
    pub hits: u64,
    pub pages_with_cookie: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutcomeSnapshot {
    pub ok: u64,
    pub error_header: u64,
    pub error_trailer: u64,
    pub aborted: u64,
}

/// Serializable copy of [`ProtocolStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub store: StoreSnapshot,
    pub retrieve: RetrieveSnapshot,
    pub retrieve_metadata: RetrieveSnapshot,
    pub query: QuerySnapshot,
    pub outcomes: OutcomeSnapshot,
    pub acceptor_rebuilds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn data_and_metadata_retrieves_are_separate() {
        let stats = ProtocolStats::default();
        stats
            .retrieve
            .record(1000, Duration::from_millis(2), Duration::from_millis(5));
        stats
            .retrieve_metadata
            .record(10, Duration::from_millis(1), Duration::ZERO);
        let snap = stats.snapshot();
        assert_eq!(snap.retrieve.bytes, 1000);
        assert_eq!(snap.retrieve.storage_millis, 2);
        assert_eq!(snap.retrieve.network_millis, 5);
        assert_eq!(snap.retrieve_metadata.requests, 1);
        assert_eq!(snap.retrieve_metadata.bytes, 10);
    }

    #[test]
    fn concurrent_writers() {
        let stats = Arc::new(ProtocolStats::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.query.record(2, false);
                        stats.outcomes.record(Outcome::Ok);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.query.requests, 8000);
        assert_eq!(snap.query.hits, 16000);
        assert_eq!(snap.outcomes.ok, 8000);
    }
}

//! Multi-port connection acceptor.
//!
//! # Responsibilities
//! - Bind one listener per configured port with `SO_REUSEADDR`
//! - Wait on all listeners at once and accept from whichever is ready
//! - Tune accepted sockets (no delay, linger 0)
//! - Rebuild the wait set after a run of empty polls
//!
//! # Design Decisions
//! - The wait set is a `StreamMap` keyed by listener index; rebuilding it
//!   unwraps the listeners and wraps them again, so bound sockets survive
//! - Tokio's reactor keeps each listener registered across the rebuild, so
//!   it only resets the wait set and the counter; it repairs nothing in the
//!   reactor and exists to keep the empty-poll threshold observable
//! - Accept errors are logged and reported as "nothing accepted"; they do
//!   not count towards the rebuild threshold

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{StreamExt, StreamMap};

use crate::config::ListenerConfig;
use crate::observability::{metrics, ProtocolStats};

/// Pending-connection backlog per listener.
const LISTEN_BACKLOG: u32 = 1024;

/// Error type for acceptor setup.
#[derive(Debug)]
pub enum AcceptorError {
    /// `bind_host` is not an IP address.
    InvalidHost(String),
    /// Failed to bind a port.
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptorError::InvalidHost(host) => write!(f, "Invalid bind host: {}", host),
            AcceptorError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
        }
    }
}

impl std::error::Error for AcceptorError {}

/// A connection taken off one of the listeners.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Local address, i.e. which of the ports the client dialed.
    pub local: SocketAddr,
}

/// Accepts connections from several listening ports.
pub struct MultiPortAcceptor {
    wait_set: StreamMap<usize, TcpListenerStream>,
    local_addrs: Vec<SocketAddr>,
    empty_polls: u32,
    rebuild_after: u32,
    rebuilds: u64,
    stats: Option<Arc<ProtocolStats>>,
}

impl MultiPortAcceptor {
    /// Bind every configured port.
    pub fn bind(config: &ListenerConfig) -> Result<Self, AcceptorError> {
        let host: IpAddr = config
            .bind_host
            .parse()
            .map_err(|_| AcceptorError::InvalidHost(config.bind_host.clone()))?;

        let mut wait_set = StreamMap::new();
        let mut local_addrs = Vec::with_capacity(config.ports.len());
        for (index, port) in config.ports.iter().enumerate() {
            let addr = SocketAddr::new(host, *port);
            let listener = bind_listener(addr).map_err(|e| AcceptorError::Bind(addr, e))?;
            let local = listener.local_addr().map_err(|e| AcceptorError::Bind(addr, e))?;
            tracing::info!(address = %local, "Listener bound");
            local_addrs.push(local);
            wait_set.insert(index, TcpListenerStream::new(listener));
        }

        Ok(Self {
            wait_set,
            local_addrs,
            empty_polls: 0,
            rebuild_after: config.rebuild_after_empty_polls.max(1),
            rebuilds: 0,
            stats: None,
        })
    }

    /// Count rebuilds in the node's statistics too.
    pub fn with_stats(mut self, stats: Arc<ProtocolStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// How many times the wait set was rebuilt.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Wait up to `timeout` for one connection on any port.
    ///
    /// `Ok(None)` means nothing was accepted: the poll timed out or the
    /// accept itself failed.
    pub async fn accept_socket(&mut self, timeout: Duration) -> io::Result<Option<AcceptedSocket>> {
        if self.wait_set.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no listeners bound"));
        }

        match tokio::time::timeout(timeout, self.wait_set.next()).await {
            Ok(Some((index, Ok(stream)))) => {
                self.empty_polls = 0;
                match configure(stream) {
                    Ok(accepted) => {
                        tracing::debug!(
                            listener = index,
                            peer_addr = %accepted.peer,
                            local_addr = %accepted.local,
                            "Connection accepted"
                        );
                        Ok(Some(accepted))
                    }
                    Err(e) => {
                        tracing::warn!(listener = index, error = %e, "Dropping accepted socket");
                        Ok(None)
                    }
                }
            }
            Ok(Some((index, Err(e)))) => {
                tracing::warn!(listener = index, error = %e, "Accept failed");
                Ok(None)
            }
            Ok(None) => Err(io::Error::new(io::ErrorKind::NotConnected, "listeners closed")),
            Err(_) => {
                self.empty_polls += 1;
                if self.empty_polls >= self.rebuild_after {
                    self.rebuild();
                }
                Ok(None)
            }
        }
    }

    /// Tear the wait set down and build it again from the same listeners.
    fn rebuild(&mut self) {
        let keys: Vec<usize> = self.wait_set.keys().copied().collect();
        for key in keys {
            if let Some(stream) = self.wait_set.remove(&key) {
                self.wait_set
                    .insert(key, TcpListenerStream::new(stream.into_inner()));
            }
        }
        self.empty_polls = 0;
        self.rebuilds += 1;
        metrics::record_acceptor_rebuild();
        if let Some(stats) = &self.stats {
            stats.record_acceptor_rebuild();
        }
        tracing::debug!(rebuilds = self.rebuilds, "Acceptor wait set rebuilt");
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

#[allow(deprecated)]
fn configure(stream: TcpStream) -> io::Result<AcceptedSocket> {
    stream.set_nodelay(true)?;
    stream.set_linger(Some(Duration::ZERO))?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    Ok(AcceptedSocket {
        stream,
        peer,
        local,
    })
}

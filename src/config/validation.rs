//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, buffer sizes, thresholds)
//! - Check that version strings and addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;
use crate::http::context::ClientVersion;

/// Smallest I/O buffer the protocol handlers accept.
const MIN_BUFFER_SIZE: usize = 512;
/// Largest I/O buffer the protocol handlers accept.
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration, collecting every problem.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.ports.is_empty() {
        errors.push(ValidationError::new("listener.ports", "at least one port is required"));
    }
    let mut seen = HashSet::new();
    for port in &listener.ports {
        if *port != 0 && !seen.insert(*port) {
            errors.push(ValidationError::new(
                "listener.ports",
                format!("port {} listed twice", port),
            ));
        }
    }
    if listener.bind_host.trim().is_empty() {
        errors.push(ValidationError::new("listener.bind_host", "must not be empty"));
    }
    if listener.poll_timeout_ms == 0 {
        errors.push(ValidationError::new("listener.poll_timeout_ms", "must be > 0"));
    }
    if listener.rebuild_after_empty_polls == 0 {
        errors.push(ValidationError::new(
            "listener.rebuild_after_empty_polls",
            "must be > 0",
        ));
    }
    if listener.idle_timeout_secs == 0 {
        errors.push(ValidationError::new("listener.idle_timeout_secs", "must be > 0"));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    if config.runtime.worker_threads == Some(0) {
        errors.push(ValidationError::new("runtime.worker_threads", "must be > 0"));
    }
    if config.runtime.max_blocking_threads == 0 {
        errors.push(ValidationError::new("runtime.max_blocking_threads", "must be > 0"));
    }

    let protocol = &config.protocol;
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&protocol.buffer_size) {
        errors.push(ValidationError::new(
            "protocol.buffer_size",
            format!("must be between {} and {}", MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
        ));
    }
    if protocol.read_segments == 0 {
        errors.push(ValidationError::new("protocol.read_segments", "must be > 0"));
    }
    if protocol.response_frames == 0 {
        errors.push(ValidationError::new("protocol.response_frames", "must be > 0"));
    }
    if protocol.default_cache.trim().is_empty() {
        errors.push(ValidationError::new("protocol.default_cache", "must not be empty"));
    }
    if ClientVersion::parse(&protocol.version).is_err() {
        errors.push(ValidationError::new(
            "protocol.version",
            format!("'{}' is not major.minor", protocol.version),
        ));
    }
    if ClientVersion::parse(&protocol.structured_encoding_version).is_err() {
        errors.push(ValidationError::new(
            "protocol.structured_encoding_version",
            format!("'{}' is not major.minor", protocol.structured_encoding_version),
        ));
    }
    if protocol.max_envelope_bytes == 0 {
        errors.push(ValidationError::new("protocol.max_envelope_bytes", "must be > 0"));
    }

    if config.node.id.trim().is_empty() {
        errors.push(ValidationError::new("node.id", "must not be empty"));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

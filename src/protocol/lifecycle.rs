//! Request lifecycle shared by every protocol handler.
//!
//! # Data Flow
//! ```text
//! START
//!   → VERSION_CHECK     (HTTP/1.1 or newer, else 505)
//!   → READINESS_CHECK   (node accepting, else 503)
//!   → CONTEXT_SETUP     (log tag, host, config blob, encoding, XML envelope)
//!   → DELEGATE          (ProtocolHandler::handle)
//!   → [Ok] | [ErrorHeader] | [ErrorTrailer] | [Aborted]
//! ```
//!
//! # Design Decisions
//! - Handlers return a typed [`ProtocolError`]; this is the only place that
//!   turns one into a status code and picks how it reaches the client
//! - Nothing sent yet: status, `x-error-reason` header and a one-line body
//! - Bytes in flight and the client reads trailers: `x-error-status` and
//!   `x-error-reason` trailers on the still-open body
//! - Bytes in flight and no trailer support: the response is destroyed and
//!   the client sees the connection drop
//! - The context lives on this function's stack and is dropped before the
//!   outcome is recorded, on every exit path

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode, Version};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ClusterState, GatewayConfig, ProtocolConfig};
use crate::http::context::{ClientVersion, RequestContext, WireEncoding};
use crate::http::request::{
    ProtocolRequest, X_CONFIG_BLOB_LENGTH, X_CONFIG_GENERATION, X_DISPATCH_TARGET, X_ERROR_REASON,
    X_ERROR_STATUS, X_LOG_TAG, X_NODE_ID, X_PROTOCOL_VERSION, X_REQUEST_ID,
};
use crate::http::response::{sanitize_reason, ProtocolResponse, ResponseState};
use crate::observability::{metrics, ProtocolStats};
use crate::protocol::envelope::parse_query_envelope;
use crate::protocol::error::{ProtocolError, ProtocolResult};

/// Value of the `Trailer` header announced to trailer-capable clients.
const ERROR_TRAILERS: &str = "x-error-status, x-error-reason";

/// A concrete protocol operation (store, retrieve, query, ...).
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Dispatch target name, reported in `x-dispatch-target` and metrics.
    fn name(&self) -> &'static str;

    /// Whether an XML request body should be parsed as a query envelope.
    fn accepts_query_envelope(&self) -> bool {
        false
    }

    /// Serve one request. Output written to `response` may be partial when an
    /// error is returned.
    async fn handle(
        &self,
        ctx: &RequestContext,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<()>;
}

/// Whether the node currently takes requests.
pub trait ReadinessProbe: Send + Sync {
    fn is_accepting(&self) -> bool;
}

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    ErrorHeader,
    ErrorTrailer,
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::ErrorHeader => "error_header",
            Outcome::ErrorTrailer => "error_trailer",
            Outcome::Aborted => "aborted",
        }
    }
}

/// Runs handlers inside the version/readiness/context/error protocol.
pub struct RequestLifecycle {
    node_id: String,
    protocol: ProtocolConfig,
    structured_threshold: ClientVersion,
    readiness: Arc<dyn ReadinessProbe>,
    cluster: Arc<ClusterState>,
    stats: Arc<ProtocolStats>,
}

impl RequestLifecycle {
    pub fn new(
        config: &GatewayConfig,
        readiness: Arc<dyn ReadinessProbe>,
        cluster: Arc<ClusterState>,
        stats: Arc<ProtocolStats>,
    ) -> Self {
        Self {
            node_id: config.node.id.clone(),
            protocol: config.protocol.clone(),
            structured_threshold: config.protocol.structured_threshold(),
            readiness,
            cluster,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ProtocolStats> {
        &self.stats
    }

    /// Drive one request through the full lifecycle.
    pub async fn handle(
        &self,
        handler: &dyn ProtocolHandler,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> Outcome {
        let start = Instant::now();
        let target = handler.name();
        let log_tag = log_tag(request);

        response.set_header(X_PROTOCOL_VERSION, &self.protocol.version);
        response.set_header(X_NODE_ID, &self.node_id);
        response.set_header(X_DISPATCH_TARGET, target);

        // hyper only writes trailer fields the head declared.
        let trailers = self.supports_trailers(request);
        if trailers {
            response.set_header(header::TRAILER, ERROR_TRAILERS);
        }
        let trace = request.param_flag("trace");

        let span = tracing::info_span!(
            "request",
            tag = %log_tag,
            dispatch = target,
            method = %request.method(),
            path = %request.path(),
        );

        async move {
            let outcome = match self.run(handler, request, response, log_tag).await {
                Ok(()) => self.finish(response).await,
                Err(err) => self.report(err, trailers, trace, response).await,
            };

            let status = response.status().as_u16();
            tracing::debug!(
                outcome = outcome.as_str(),
                status,
                bytes = response.bytes_written(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Request finished"
            );
            self.stats.outcomes.record(outcome);
            metrics::record_request(target, outcome.as_str(), status, start);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        handler: &dyn ProtocolHandler,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
        log_tag: String,
    ) -> ProtocolResult<()> {
        let mut ctx = RequestContext::new(log_tag);
        // The blob goes in first so every later failure still delivers it.
        self.deliver_config_blob(&mut ctx, request, response);

        if request.version() < Version::HTTP_11 {
            return Err(ProtocolError::UnsupportedVersion(format!(
                "{:?}",
                request.version()
            )));
        }
        if !self.readiness.is_accepting() {
            return Err(ProtocolError::ServiceUnavailable(
                "node is not accepting requests".to_string(),
            ));
        }

        self.setup_context(&mut ctx, handler, request).await?;
        handler.handle(&ctx, request, response).await
    }

    fn deliver_config_blob(
        &self,
        ctx: &mut RequestContext,
        request: &ProtocolRequest,
        response: &mut ProtocolResponse,
    ) {
        if let Some(generation) = request.header_str(&X_CONFIG_GENERATION) {
            match generation.trim().parse::<u64>() {
                Ok(generation) => {
                    if let Some(blob) = self.cluster.blob_for(generation) {
                        ctx.set_config_blob(blob);
                    }
                }
                Err(_) => tracing::warn!(generation, "Ignoring malformed config generation"),
            }
        }
        if let Some(blob) = ctx.take_config_blob() {
            response.set_header(X_CONFIG_BLOB_LENGTH, &blob.len().to_string());
            response.set_prefix(blob);
        }
    }

    async fn setup_context(
        &self,
        ctx: &mut RequestContext,
        handler: &dyn ProtocolHandler,
        request: &mut ProtocolRequest,
    ) -> ProtocolResult<()> {
        ctx.requested_host = request
            .header_str(&header::HOST)
            .map(str::to_string);

        let declared = request
            .header_str(&X_PROTOCOL_VERSION)
            .map(ClientVersion::parse)
            .transpose()?;
        ctx.encoding = WireEncoding::negotiate(declared, self.structured_threshold);

        if handler.accepts_query_envelope() && request.has_xml_body() {
            let raw = request
                .body_mut()
                .read_to_end(self.protocol.max_envelope_bytes)
                .await
                .map_err(|e| match e.kind() {
                    io::ErrorKind::InvalidData => {
                        ProtocolError::BadRequest("query envelope too large".to_string())
                    }
                    _ => ProtocolError::Transport(e),
                })?;
            ctx.query_envelope = Some(parse_query_envelope(&raw)?);
        }

        Ok(())
    }

    async fn finish(&self, response: &mut ProtocolResponse) -> Outcome {
        match response.state() {
            ResponseState::Closed => Outcome::Ok,
            ResponseState::Destroyed => Outcome::Aborted,
            ResponseState::Open => match response.close().await {
                Ok(()) => Outcome::Ok,
                Err(e) => {
                    tracing::debug!(error = %e, "Client went away before the response completed");
                    Outcome::Aborted
                }
            },
        }
    }

    fn supports_trailers(&self, request: &ProtocolRequest) -> bool {
        let legacy = request
            .agent()
            .map(|agent| self.protocol.is_legacy_agent(agent))
            .unwrap_or(false);
        !legacy && request.accepts_trailers()
    }

    async fn report(
        &self,
        err: ProtocolError,
        trailers: bool,
        trace: bool,
        response: &mut ProtocolResponse,
    ) -> Outcome {
        let status = err.status();
        let reason = sanitize_reason(&err.reason());

        if err.is_internal() {
            tracing::error!(
                status = status.as_u16(),
                error = %err.diagnostic_chain(),
                "Request failed"
            );
        } else {
            tracing::info!(status = status.as_u16(), reason = %reason, "Request failed");
        }

        if let ProtocolError::Transport(e) = &err {
            tracing::debug!(error = %e, "Transport failure, aborting response");
            response.destroy().await;
            return Outcome::Aborted;
        }

        let state = response.state();
        if state != ResponseState::Open {
            let escalated = io::Error::new(
                io::ErrorKind::NotConnected,
                format!("cannot report {} on a {:?} response", status.as_u16(), state),
            );
            tracing::warn!(error = %escalated, "Error reporting failed");
            response.destroy().await;
            return Outcome::Aborted;
        }

        if !response.is_committed() {
            self.report_in_header(status, &reason, &err, trace, response)
                .await
        } else if trailers {
            self.report_in_trailer(status, &reason, response).await
        } else {
            tracing::debug!("Client cannot read trailers, destroying response");
            response.destroy().await;
            Outcome::Aborted
        }
    }

    async fn report_in_header(
        &self,
        status: StatusCode,
        reason: &str,
        err: &ProtocolError,
        trace: bool,
        response: &mut ProtocolResponse,
    ) -> Outcome {
        response.set_status(status);
        response.set_reason(reason);
        response.set_header(X_ERROR_REASON, reason);
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );

        let mut body = format!("{} {}\n", status.as_u16(), reason);
        if trace {
            body.push_str(&err.diagnostic_chain());
            body.push('\n');
        }

        let written = match response.write(body.into()).await {
            Ok(()) => response.close().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Outcome::ErrorHeader,
            Err(e) => {
                tracing::debug!(error = %e, "Client went away while reading the error");
                response.destroy().await;
                Outcome::Aborted
            }
        }
    }

    async fn report_in_trailer(
        &self,
        status: StatusCode,
        reason: &str,
        response: &mut ProtocolResponse,
    ) -> Outcome {
        let prefixed = sanitize_reason(&format!("{}: {}", self.node_id, reason));
        let trailers = response.trailers_mut();
        trailers.insert(X_ERROR_STATUS, HeaderValue::from(status.as_u16()));
        if let Ok(value) = HeaderValue::from_str(&prefixed) {
            trailers.insert(X_ERROR_REASON, value);
        }
        match response.close().await {
            Ok(()) => Outcome::ErrorTrailer,
            Err(e) => {
                tracing::debug!(error = %e, "Client went away before the trailers");
                Outcome::Aborted
            }
        }
    }
}

fn log_tag(request: &ProtocolRequest) -> String {
    request
        .header_str(&X_LOG_TAG)
        .or_else(|| request.header_str(&X_REQUEST_ID))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..12].to_string())
}

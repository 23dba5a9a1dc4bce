//! HTTP server setup and connection dispatch.
//!
//! # Responsibilities
//! - Create Axum Router with one route per protocol handler
//! - Wire up middleware (tracing, request ID)
//! - Run each request's lifecycle in its own task, streaming the response
//! - Pull connections off the acceptor within the worker-pool bound
//! - Drain in-flight connections on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::{get, post},
    Router,
};
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, Semaphore};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{GatewayConfig, ListenerConfig};
use crate::http::request::ProtocolRequest;
use crate::http::response::ProtocolResponse;
use crate::net::{serve_connection, ConnectionTracker, MultiPortAcceptor};
use crate::protocol::query::QueryHandler;
use crate::protocol::retrieve::{RetrieveHandler, RetrieveMetadataHandler};
use crate::protocol::stats_handler::StatsHandler;
use crate::protocol::store::StoreHandler;
use crate::protocol::{ProtocolHandler, ProtocolServices, RequestLifecycle};

/// How long shutdown waits for in-flight connections.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Application state injected into handlers.
#[derive(Clone)]
struct AppState {
    lifecycle: Arc<RequestLifecycle>,
    response_frames: usize,
}

/// HTTP server for the object gateway.
pub struct GatewayServer {
    router: Router,
    listener: ListenerConfig,
}

impl GatewayServer {
    /// Build the server around a lifecycle and the handler services.
    pub fn new(
        config: &GatewayConfig,
        lifecycle: Arc<RequestLifecycle>,
        services: ProtocolServices,
    ) -> Self {
        let state = AppState {
            lifecycle,
            response_frames: config.protocol.response_frames,
        };
        Self {
            router: Self::build_router(state, services),
            listener: config.listener.clone(),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState, services: ProtocolServices) -> Router {
        let stats = Arc::clone(&services.stats);
        let query = protocol_route(Arc::new(QueryHandler::buffered(services.clone())));
        let query_plus = protocol_route(Arc::new(QueryHandler::streamed(services.clone())));

        Router::new()
            .route(
                "/store",
                post(protocol_route(Arc::new(StoreHandler::data(services.clone())))),
            )
            .route(
                "/store-both",
                post(protocol_route(Arc::new(StoreHandler::both(services.clone())))),
            )
            .route(
                "/store-metadata",
                post(protocol_route(Arc::new(StoreHandler::metadata(services.clone())))),
            )
            .route(
                "/retrieve/{id}",
                get(protocol_route(Arc::new(RetrieveHandler::new(services.clone())))),
            )
            .route(
                "/retrieve-metadata/{id}",
                get(protocol_route(Arc::new(RetrieveMetadataHandler::new(services)))),
            )
            .route("/query", get(query.clone()).post(query))
            .route("/query-plus", get(query_plus.clone()).post(query_plus))
            .route("/stats", get(protocol_route(Arc::new(StatsHandler::new(stats)))))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// The fully layered router, for serving without the acceptor.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Accept and serve connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        mut acceptor: MultiPortAcceptor,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let workers = Arc::new(Semaphore::new(self.listener.max_connections.max(1)));
        let tracker = ConnectionTracker::new();
        let poll_timeout = Duration::from_millis(self.listener.poll_timeout_ms.max(1));
        let idle_timeout = Duration::from_secs(self.listener.idle_timeout_secs.max(1));

        tracing::info!(
            addresses = ?acceptor.local_addrs(),
            max_connections = self.listener.max_connections,
            "Gateway server starting"
        );

        loop {
            // Backpressure: no accept without a free worker.
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = acceptor.accept_socket(poll_timeout) => accepted?,
            };
            let Some(socket) = accepted else {
                continue;
            };

            let guard = tracker.track();
            let router = self.router.clone();
            tokio::spawn(async move {
                serve_connection(socket, router, idle_timeout, guard).await;
                drop(permit);
            });
        }

        tracing::info!(
            active_connections = tracker.active_count(),
            "Stopped accepting, draining connections"
        );
        if !tracker.drain(DRAIN_DEADLINE).await {
            tracing::warn!(
                active_connections = tracker.active_count(),
                "Drain deadline passed with connections still open"
            );
        }
        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

/// Axum handler that runs `handler` through the protocol lifecycle.
fn protocol_route(
    handler: Arc<dyn ProtocolHandler>,
) -> impl Fn(State<AppState>, Request<Body>) -> BoxFuture<'static, Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |State(state): State<AppState>, request: Request<Body>| {
        let future: BoxFuture<'static, Response> =
            Box::pin(dispatch(state, Arc::clone(&handler), request));
        future
    }
}

/// Spawn the lifecycle task and answer with the streamed response.
async fn dispatch(
    state: AppState,
    handler: Arc<dyn ProtocolHandler>,
    request: Request<Body>,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let mut request = ProtocolRequest::from_http(request, remote_addr);
    let (mut response, handle) = ProtocolResponse::channel(state.response_frames);

    let lifecycle = state.lifecycle;
    tokio::spawn(async move {
        lifecycle
            .handle(handler.as_ref(), &mut request, &mut response)
            .await;
    });

    handle.into_http().await
}

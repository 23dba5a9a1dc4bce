//! `GET /stats`: JSON snapshot of the node's protocol counters.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderValue};

use crate::http::context::RequestContext;
use crate::http::request::ProtocolRequest;
use crate::http::response::ProtocolResponse;
use crate::observability::ProtocolStats;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::lifecycle::ProtocolHandler;

pub struct StatsHandler {
    stats: Arc<ProtocolStats>,
}

impl StatsHandler {
    pub fn new(stats: Arc<ProtocolStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl ProtocolHandler for StatsHandler {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn handle(
        &self,
        _ctx: &RequestContext,
        _request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<()> {
        let body = serde_json::to_vec_pretty(&self.stats.snapshot())
            .map_err(|e| ProtocolError::internal_from("cannot serialize statistics", e))?;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.write(body.into()).await?;
        Ok(())
    }
}

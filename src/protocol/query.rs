//! Query protocol: cookie-paginated metadata queries.
//!
//! # Data Flow
//! ```text
//! GET|POST /query       → QueryEngine::query        → whole envelope, one write
//! GET|POST /query-plus  → QueryEngine::query_stream → envelope written per event
//! ```
//!
//! # Design Decisions
//! - Parameters come from the query string, the `x-query-cookie` header or
//!   an XML envelope body; envelope fields win
//! - A cookie resumes a scan and replaces text, key, select and params
//! - The streamed variant opens the envelope only when the engine produces
//!   its first event, so a failing scan is still reported in the header

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::{header, HeaderValue};
use bytes::BytesMut;
use futures_util::StreamExt;

use crate::http::context::RequestContext;
use crate::http::request::{ProtocolRequest, X_QUERY_COOKIE};
use crate::http::response::ProtocolResponse;
use crate::observability::metrics;
use crate::protocol::envelope::{decode_cookie, EnvelopeFormat, QueryTerminal};
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::lifecycle::ProtocolHandler;
use crate::protocol::ProtocolServices;
use crate::query::{QueryEvent, QueryRequest};

/// Prefix of query-string parameters bound to `:name` placeholders.
const PARAM_PREFIX: &str = "p.";

/// How results reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Collect the page, then send it.
    Buffered,
    /// Send every hit as the engine yields it.
    Streamed,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Assemble the engine request from parameters, headers and envelope.
pub fn build_query_request(
    ctx: &RequestContext,
    request: &ProtocolRequest,
    default_cache: &str,
) -> ProtocolResult<QueryRequest> {
    let envelope = ctx.query_envelope.clone().unwrap_or_default();

    let cache_id = envelope
        .cache
        .or_else(|| request.param("cache").map(str::to_string))
        .unwrap_or_else(|| default_cache.to_string());

    let max_results = match envelope.max_results {
        Some(max) => Some(max),
        None => request
            .param("max")
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|_| {
                    ProtocolError::BadRequest(format!("invalid max results '{}'", raw))
                })
            })
            .transpose()?,
    };

    let cookie = match envelope.cookie {
        Some(cookie) => Some(cookie),
        None => request
            .param("cookie")
            .or_else(|| request.header_str(&X_QUERY_COOKIE))
            .map(decode_cookie)
            .transpose()?,
    };

    if cookie.is_some() {
        return Ok(QueryRequest {
            cache_id,
            cookie,
            max_results,
            ..Default::default()
        });
    }

    let mut params: BTreeMap<String, String> = request
        .params()
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(PARAM_PREFIX)
                .map(|bound| (bound.to_string(), value.clone()))
        })
        .collect();
    params.extend(envelope.params);

    let select = if envelope.select.is_empty() {
        request.param("select").map(split_list).unwrap_or_default()
    } else {
        envelope.select
    };

    Ok(QueryRequest {
        cache_id,
        text: envelope
            .text
            .or_else(|| request.param("q").map(str::to_string)),
        key: envelope
            .key
            .or_else(|| request.param("key").map(str::to_string)),
        select,
        params,
        cookie: None,
        max_results,
    })
}

/// `/query` and `/query-plus`.
pub struct QueryHandler {
    mode: QueryMode,
    services: ProtocolServices,
}

impl QueryHandler {
    pub fn buffered(services: ProtocolServices) -> Self {
        Self {
            mode: QueryMode::Buffered,
            services,
        }
    }

    pub fn streamed(services: ProtocolServices) -> Self {
        Self {
            mode: QueryMode::Streamed,
            services,
        }
    }

    async fn run_buffered(
        &self,
        query: QueryRequest,
        format: EnvelopeFormat,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<(u64, bool)> {
        let page = self.services.query.query(&query).await?;

        let mut writer = format.query_writer();
        let mut out = BytesMut::new();
        writer.open(&mut out)?;
        for hit in &page.hits {
            writer.hit(&mut out, hit)?;
        }
        let has_cookie = page.cookie.is_some();
        writer.close(
            &mut out,
            &QueryTerminal {
                count: page.hits.len() as u64,
                cookie: page.cookie,
                integrity_time: page.integrity_time,
            },
        )?;
        response.write(out.freeze()).await?;
        Ok((page.hits.len() as u64, has_cookie))
    }

    async fn run_streamed(
        &self,
        query: QueryRequest,
        format: EnvelopeFormat,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<(u64, bool)> {
        let mut events = self.services.query.query_stream(query);
        let mut writer = format.query_writer();
        let mut opened = false;
        let mut count = 0u64;

        while let Some(event) = events.next().await {
            let event = event?;
            let mut out = BytesMut::new();
            if !opened {
                writer.open(&mut out)?;
                opened = true;
            }
            match event {
                QueryEvent::Hit(hit) => {
                    writer.hit(&mut out, &hit)?;
                    count += 1;
                    response.write(out.freeze()).await?;
                }
                QueryEvent::End {
                    cookie,
                    integrity_time,
                } => {
                    let has_cookie = cookie.is_some();
                    writer.close(
                        &mut out,
                        &QueryTerminal {
                            count,
                            cookie,
                            integrity_time,
                        },
                    )?;
                    response.write(out.freeze()).await?;
                    return Ok((count, has_cookie));
                }
            }
        }

        Err(ProtocolError::internal(
            "query stream ended without a terminal event",
        ))
    }
}

#[async_trait]
impl ProtocolHandler for QueryHandler {
    fn name(&self) -> &'static str {
        match self.mode {
            QueryMode::Buffered => "query",
            QueryMode::Streamed => "query-plus",
        }
    }

    fn accepts_query_envelope(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        request: &mut ProtocolRequest,
        response: &mut ProtocolResponse,
    ) -> ProtocolResult<()> {
        let query = build_query_request(ctx, request, &self.services.config.default_cache)?;
        let format = EnvelopeFormat::from_binary_flag(request.param_flag("binary"));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(format.content_type()),
        );

        let resumed = query.cookie.is_some();
        let (hits, has_cookie) = match self.mode {
            QueryMode::Buffered => self.run_buffered(query, format, response).await?,
            QueryMode::Streamed => self.run_streamed(query, format, response).await?,
        };

        self.services.stats.query.record(hits, has_cookie);
        metrics::record_query_hits(hits);
        tracing::debug!(hits, resumed, more = has_cookie, "Query finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::http::response::CollectedResponse;
    use crate::observability::ProtocolStats;
    use crate::protocol::envelope::{encode_cookie, QueryEnvelope};
    use crate::protocol::test_support::run;
    use crate::query::MemoryQueryEngine;
    use crate::storage::{MemoryStorage, MetadataRecord, ObjectId};
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use std::sync::Arc;

    fn seeded(n: usize) -> (Arc<MemoryQueryEngine>, ProtocolServices) {
        let storage = Arc::new(MemoryStorage::new());
        for i in 0..n {
            let color = if i % 3 == 0 { "red" } else { "blue" };
            storage.insert_object(
                "default",
                b"x",
                Some(
                    MetadataRecord::new()
                        .with("color", color)
                        .with("n", i.to_string()),
                ),
            );
        }
        let engine = Arc::new(MemoryQueryEngine::new(Arc::clone(&storage)));
        let services = ProtocolServices::new(
            &ProtocolConfig::default(),
            storage,
            Arc::clone(&engine) as Arc<dyn crate::query::QueryEngine>,
            Arc::new(ProtocolStats::default()),
        );
        (engine, services)
    }

    fn get(path: &str) -> ProtocolRequest {
        ProtocolRequest::new(Method::GET, path, Body::empty())
    }

    fn decode(
        res: &CollectedResponse,
        format: EnvelopeFormat,
    ) -> crate::protocol::envelope::QueryResultEnvelope {
        format.decode_query_result(&res.body).unwrap()
    }

    #[test]
    fn cookie_suppresses_other_fields() {
        let ctx = RequestContext::default();
        let request = get("/query?q=color%3Dred&select=a,b&cookie=6869&p.x=1&max=5");
        let query = build_query_request(&ctx, &request, "default").unwrap();
        assert_eq!(query.cookie, Some(b"hi".to_vec()));
        assert_eq!(query.max_results, Some(5));
        assert!(query.text.is_none());
        assert!(query.select.is_empty());
        assert!(query.params.is_empty());
    }

    #[test]
    fn envelope_fields_take_precedence() {
        let mut ctx = RequestContext::default();
        ctx.query_envelope = Some(QueryEnvelope {
            text: Some("color = :c".to_string()),
            params: BTreeMap::from([("c".to_string(), "red".to_string())]),
            select: vec!["n".to_string()],
            max_results: Some(2),
            ..Default::default()
        });
        let request = get("/query?q=ignored&select=color&max=9&p.c=blue&p.d=4&cache=pics");
        let query = build_query_request(&ctx, &request, "default").unwrap();
        assert_eq!(query.text.as_deref(), Some("color = :c"));
        assert_eq!(query.select, vec!["n"]);
        assert_eq!(query.max_results, Some(2));
        assert_eq!(query.params.get("c").map(String::as_str), Some("red"));
        assert_eq!(query.params.get("d").map(String::as_str), Some("4"));
        assert_eq!(query.cache_id, "pics");
    }

    #[test]
    fn cookie_header_and_bad_values() {
        let ctx = RequestContext::default();
        let request = get("/query").with_header("x-query-cookie", "6869");
        let query = build_query_request(&ctx, &request, "default").unwrap();
        assert_eq!(query.cookie, Some(b"hi".to_vec()));

        assert!(build_query_request(&ctx, &get("/query?cookie=zz"), "default").is_err());
        assert!(build_query_request(&ctx, &get("/query?max=-1"), "default").is_err());
    }

    #[tokio::test]
    async fn pages_concatenate_to_the_uncapped_result() {
        for mode in [QueryMode::Buffered, QueryMode::Streamed] {
            let (_, services) = seeded(23);
            let handler = QueryHandler { mode, services };

            let res = run(&handler, get("/query?binary=1&q=*")).await;
            let whole = decode(&res, EnvelopeFormat::Binary);
            assert!(whole.terminal.cookie.is_none());
            let expected: Vec<ObjectId> = whole.hits.into_iter().map(|h| h.id).collect();
            assert_eq!(expected.len(), 23);

            let mut paged = Vec::new();
            let mut cookie: Option<Vec<u8>> = None;
            loop {
                let path = match &cookie {
                    Some(c) => format!("/query?binary=1&max=5&cookie={}", encode_cookie(c)),
                    None => "/query?binary=1&max=5&q=*".to_string(),
                };
                let res = run(&handler, get(&path)).await;
                assert_eq!(res.status, Some(StatusCode::OK), "{}", res.body_text());
                let page = decode(&res, EnvelopeFormat::Binary);
                assert_eq!(page.terminal.count, page.hits.len() as u64);
                assert_eq!(page.hits.len(), 5.min(expected.len() - paged.len()));
                paged.extend(page.hits.into_iter().map(|h| h.id));
                match page.terminal.cookie {
                    Some(next) => cookie = Some(next),
                    None => break,
                }
            }
            assert_eq!(paged, expected);
        }
    }

    #[tokio::test]
    async fn filter_and_projection_in_xml() {
        let (_, services) = seeded(9);
        let handler = QueryHandler::buffered(services);
        let res = run(&handler, get("/query?q=color%3D%3Ac&p.c=red&select=n")).await;
        assert_eq!(res.header("content-type"), Some("text/xml; charset=utf-8"));
        let page = decode(&res, EnvelopeFormat::Xml);
        assert_eq!(page.hits.len(), 3);
        assert!(page
            .hits
            .iter()
            .all(|h| h.fields.keys().map(String::as_str).eq(["n"])));
        assert!(page.terminal.cookie.is_none());
    }

    #[tokio::test]
    async fn zero_max_yields_nothing() {
        let (_, services) = seeded(4);
        let res = run(&QueryHandler::streamed(services), get("/query-plus?max=0")).await;
        let page = decode(&res, EnvelopeFormat::Xml);
        assert!(page.hits.is_empty());
        assert_eq!(page.terminal.count, 0);
        assert!(page.terminal.cookie.is_none());
    }

    #[tokio::test]
    async fn xml_envelope_body_drives_the_query() {
        let (_, services) = seeded(6);
        let body = r#"<query max="10"><text>color = red</text><select>color</select></query>"#;
        let request = ProtocolRequest::new(Method::POST, "/query", Body::from(body))
            .with_header("content-type", "text/xml");
        let res = run(&QueryHandler::buffered(services), request).await;
        let page = decode(&res, EnvelopeFormat::Xml);
        assert_eq!(page.hits.len(), 2);
        assert!(page.hits.iter().all(|h| h.fields.get("color").map(String::as_str) == Some("red")));
    }

    #[tokio::test]
    async fn streamed_failure_before_first_event_is_header_error() {
        let (engine, services) = seeded(5);
        engine.fail_after_hits(0);
        let request = get("/query-plus").with_header("te", "trailers");
        let res = run(&QueryHandler::streamed(services), request).await;
        assert_eq!(res.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(res.trailers.is_none());
    }

    #[tokio::test]
    async fn streamed_failure_after_hits_goes_to_trailer() {
        let (engine, services) = seeded(5);
        engine.fail_after_hits(2);
        let request = get("/query-plus?binary=1").with_header("te", "trailers");
        let res = run(&QueryHandler::streamed(services), request).await;
        assert_eq!(res.status, Some(StatusCode::OK));
        assert_eq!(&res.body[..4], b"QRY1");
        assert_eq!(res.trailer("x-error-status"), Some("500"));
    }

    #[tokio::test]
    async fn buffered_failure_is_always_header_error() {
        let (engine, services) = seeded(5);
        engine.fail_after_hits(2);
        let res = run(&QueryHandler::buffered(services), get("/query")).await;
        assert_eq!(res.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(res.body_text().starts_with("500 "));
    }

    #[tokio::test]
    async fn invalid_query_is_400() {
        let (_, services) = seeded(1);
        let res = run(&QueryHandler::buffered(services), get("/query?q=color%3D%3Amissing")).await;
        assert_eq!(res.status, Some(StatusCode::BAD_REQUEST));
    }
}

//! In-memory query engine over [`MemoryStorage`].
//!
//! Filters are conjunctions of `field = value` / `field != value` clauses
//! joined by `and`; `*` or an empty filter matches everything. Values may be
//! quoted or bound with `:name`. Results are ordered by object id, which makes
//! the cookie a simple "resume after this id" marker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{Hit, QueryEngine, QueryError, QueryEvent, QueryPage, QueryRequest, QueryResult};
use crate::storage::{MemoryStorage, MetadataRecord, ObjectId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Eq(String, String),
    Ne(String, String),
}

impl Clause {
    fn matches(&self, record: &MetadataRecord) -> bool {
        match self {
            Clause::Eq(field, value) => record.get(field) == Some(value.as_str()),
            Clause::Ne(field, value) => record.get(field) != Some(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Eq,
    Ne,
}

fn tokenize(text: &str) -> QueryResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(QueryError::InvalidQuery("expected '!='".to_string()));
                }
                tokens.push(Token::Ne);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => {
                            return Err(QueryError::InvalidQuery(
                                "unterminated string".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '=' | '!' | '"' | '\'') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn parse_filter(text: &str, params: &BTreeMap<String, String>) -> QueryResult<Vec<Clause>> {
    let text = text.trim();
    if text.is_empty() || text == "*" {
        return Ok(Vec::new());
    }

    let tokens = tokenize(text)?;
    let mut clauses = Vec::new();
    let mut iter = tokens.into_iter();
    loop {
        let field = match iter.next() {
            Some(Token::Word(field)) => field,
            other => {
                return Err(QueryError::InvalidQuery(format!(
                    "expected field name, found {:?}",
                    other
                )))
            }
        };
        let op = iter.next();
        let value = match iter.next() {
            Some(Token::Quoted(value)) => value,
            Some(Token::Word(word)) => match word.strip_prefix(':') {
                Some(name) => params.get(name).cloned().ok_or_else(|| {
                    QueryError::InvalidQuery(format!("unbound parameter :{}", name))
                })?,
                None => word,
            },
            other => {
                return Err(QueryError::InvalidQuery(format!(
                    "expected value after {}, found {:?}",
                    field, other
                )))
            }
        };
        clauses.push(match op {
            Some(Token::Eq) => Clause::Eq(field, value),
            Some(Token::Ne) => Clause::Ne(field, value),
            other => {
                return Err(QueryError::InvalidQuery(format!(
                    "expected operator after {}, found {:?}",
                    field, other
                )))
            }
        });
        match iter.next() {
            None => break,
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("and") => continue,
            Some(other) => {
                return Err(QueryError::InvalidQuery(format!(
                    "expected 'and', found {:?}",
                    other
                )))
            }
        }
    }
    Ok(clauses)
}

/// Everything needed to continue a scan, serialized into the cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScanState {
    cache_id: String,
    text: Option<String>,
    key: Option<String>,
    select: Vec<String>,
    params: BTreeMap<String, String>,
    after: Option<ObjectId>,
    integrity_ms: i64,
}

impl ScanState {
    fn begin(request: &QueryRequest) -> QueryResult<Self> {
        if let Some(cookie) = &request.cookie {
            return serde_json::from_slice(cookie).map_err(|_| QueryError::InvalidCookie);
        }
        if request.cache_id.is_empty() {
            return Err(QueryError::InvalidQuery("cache id required".to_string()));
        }
        Ok(Self {
            cache_id: request.cache_id.clone(),
            text: request.text.clone(),
            key: request.key.clone(),
            select: request.select.clone(),
            params: request.params.clone(),
            after: None,
            integrity_ms: Utc::now().timestamp_millis(),
        })
    }

    fn integrity_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.integrity_ms).unwrap_or_default()
    }

    fn cookie_after(&self, last: &ObjectId) -> Vec<u8> {
        let mut next = self.clone();
        next.after = Some(last.clone());
        serde_json::to_vec(&next).unwrap_or_default()
    }

    fn project(&self, id: ObjectId, record: MetadataRecord) -> Hit {
        let fields = if self.select.is_empty() {
            record.fields
        } else {
            record
                .fields
                .into_iter()
                .filter(|(name, _)| self.select.iter().any(|s| s == name))
                .collect()
        };
        Hit { id, fields }
    }
}

/// Query engine reading the metadata held by a [`MemoryStorage`].
pub struct MemoryQueryEngine {
    storage: Arc<MemoryStorage>,
    /// Scans fail after yielding this many hits.
    fail_after_hits: Arc<AtomicU64>,
}

impl MemoryQueryEngine {
    pub fn new(storage: Arc<MemoryStorage>) -> Self {
        Self {
            storage,
            fail_after_hits: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    /// Make every scan fail once it has produced `hits` results.
    pub fn fail_after_hits(&self, hits: u64) {
        self.fail_after_hits.store(hits, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueryEngine for MemoryQueryEngine {
    async fn query(&self, request: &QueryRequest) -> QueryResult<QueryPage> {
        let mut stream = self.query_stream(request.clone());
        let mut hits = Vec::new();
        while let Some(event) = stream.next().await {
            match event? {
                QueryEvent::Hit(hit) => hits.push(hit),
                QueryEvent::End {
                    cookie,
                    integrity_time,
                } => {
                    return Ok(QueryPage {
                        hits,
                        cookie,
                        integrity_time,
                    })
                }
            }
        }
        Err(QueryError::Engine("scan ended without a terminal event".to_string()))
    }

    fn query_stream(&self, request: QueryRequest) -> BoxStream<'static, QueryResult<QueryEvent>> {
        let storage = Arc::clone(&self.storage);
        let fail_after = self.fail_after_hits.load(Ordering::SeqCst);
        Box::pin(async_stream::try_stream! {
            let scan = ScanState::begin(&request)?;
            let clauses = parse_filter(scan.text.as_deref().unwrap_or(""), &scan.params)?;
            let max = request.max_results.map(u64::from).unwrap_or(u64::MAX);
            let integrity_time = scan.integrity_time();

            let candidates = storage
                .indexed_objects(&scan.cache_id)
                .into_iter()
                .filter(|(id, _)| scan.after.as_ref().map_or(true, |after| id > after))
                .filter(|(id, _)| scan.key.as_deref().map_or(true, |key| id.as_str() == key))
                .filter(|(_, record)| clauses.iter().all(|c| c.matches(record)));

            let mut emitted = 0u64;
            let mut last: Option<ObjectId> = None;
            let mut more = false;
            for (id, record) in candidates {
                if emitted >= max {
                    more = true;
                    break;
                }
                if emitted >= fail_after {
                    Err(QueryError::Engine("index segment unavailable".to_string()))?;
                }
                last = Some(id.clone());
                emitted += 1;
                yield QueryEvent::Hit(scan.project(id, record));
            }

            let cookie = match (more && max > 0, last) {
                (true, Some(last)) => Some(scan.cookie_after(&last)),
                _ => None,
            };
            yield QueryEvent::End { cookie, integrity_time };
        })
    }
}

//! XML envelope format.
//!
//! ```text
//! <queryResult>
//!   <hit id="..."><field name="...">value</field>...</hit>...
//!   <count>n</count>
//!   <cookie>hex</cookie> | <noMoreResults/>
//!   <integrityTime>rfc3339</integrityTime>
//! </queryResult>
//!
//! <object id="..." size="..." created="..." contentHash="..." queryReady="..."/>
//!
//! <query cache="..." max="...">
//!   <text>...</text> <param name="...">...</param> <select>a,b</select>
//!   <key>...</key> <cookie>hex</cookie>
//! </query>
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Display;

use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use super::{
    decode_cookie, encode_cookie, EnvelopeError, EnvelopeResult, EnvelopeWriter, QueryEnvelope,
    QueryResultEnvelope, QueryTerminal,
};
use crate::query::Hit;
use crate::storage::{ObjectId, ObjectMetadata};

fn xml_err(e: impl Display) -> EnvelopeError {
    EnvelopeError::Xml(e.to_string())
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> EnvelopeResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| EnvelopeError::Malformed(format!("bad timestamp '{}'", raw)))
}

/// Write a sequence of events and append them to `out`.
fn emit<'a>(out: &mut BytesMut, events: impl IntoIterator<Item = Event<'a>>) -> EnvelopeResult<()> {
    let mut writer = Writer::new(Vec::new());
    for event in events {
        writer.write_event(event).map_err(xml_err)?;
    }
    out.extend_from_slice(&writer.into_inner());
    Ok(())
}

fn text_element<'a>(name: &'a str, text: &'a str) -> [Event<'a>; 3] {
    [
        Event::Start(BytesStart::new(name)),
        Event::Text(BytesText::new(text)),
        Event::End(BytesEnd::new(name)),
    ]
}

/// Writer for the XML query-result form.
pub struct XmlEnvelopeWriter;

impl EnvelopeWriter for XmlEnvelopeWriter {
    fn open(&mut self, out: &mut BytesMut) -> EnvelopeResult<()> {
        emit(
            out,
            [
                Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
                Event::Start(BytesStart::new("queryResult")),
            ],
        )
    }

    fn hit(&mut self, out: &mut BytesMut, hit: &Hit) -> EnvelopeResult<()> {
        let mut events = Vec::with_capacity(2 + hit.fields.len() * 3);
        events.push(Event::Start(
            BytesStart::new("hit").with_attributes([("id", hit.id.as_str())]),
        ));
        for (name, value) in &hit.fields {
            events.push(Event::Start(
                BytesStart::new("field").with_attributes([("name", name.as_str())]),
            ));
            events.push(Event::Text(BytesText::new(value)));
            events.push(Event::End(BytesEnd::new("field")));
        }
        events.push(Event::End(BytesEnd::new("hit")));
        emit(out, events)
    }

    fn close(&mut self, out: &mut BytesMut, terminal: &QueryTerminal) -> EnvelopeResult<()> {
        let count = terminal.count.to_string();
        let cookie = terminal.cookie.as_deref().map(encode_cookie);
        let integrity = format_time(&terminal.integrity_time);

        let mut events = Vec::new();
        events.extend(text_element("count", &count));
        match &cookie {
            Some(cookie) => events.extend(text_element("cookie", cookie)),
            None => events.push(Event::Empty(BytesStart::new("noMoreResults"))),
        }
        events.extend(text_element("integrityTime", &integrity));
        events.push(Event::End(BytesEnd::new("queryResult")));
        emit(out, events)
    }
}

pub fn encode_object(out: &mut BytesMut, meta: &ObjectMetadata) -> EnvelopeResult<()> {
    let size = meta.size.to_string();
    let created = format_time(&meta.created);
    let query_ready = meta.query_ready.to_string();
    emit(
        out,
        [
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
            Event::Empty(BytesStart::new("object").with_attributes([
                ("id", meta.id.as_str()),
                ("size", size.as_str()),
                ("created", created.as_str()),
                ("contentHash", meta.content_hash.as_str()),
                ("queryReady", query_ready.as_str()),
            ])),
        ],
    )
}

fn attributes(start: &BytesStart<'_>) -> EnvelopeResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?;
        out.insert(key, value.into_owned());
    }
    Ok(out)
}

fn required<'a>(attrs: &'a BTreeMap<String, String>, name: &str) -> EnvelopeResult<&'a str> {
    attrs
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| EnvelopeError::Malformed(format!("missing attribute '{}'", name)))
}

fn parse_number<T: std::str::FromStr>(raw: &str, what: &str) -> EnvelopeResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| EnvelopeError::Malformed(format!("bad {} '{}'", what, raw)))
}

fn parse_id(raw: &str) -> EnvelopeResult<ObjectId> {
    ObjectId::parse(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

fn utf8(raw: &[u8]) -> EnvelopeResult<&str> {
    std::str::from_utf8(raw).map_err(|_| EnvelopeError::Malformed("body is not UTF-8".to_string()))
}

fn unescape(text: &BytesText<'_>) -> EnvelopeResult<Cow<'static, str>> {
    Ok(Cow::Owned(text.unescape().map_err(xml_err)?.into_owned()))
}

pub fn decode_object(raw: &[u8]) -> EnvelopeResult<ObjectMetadata> {
    let mut reader = Reader::from_str(utf8(raw)?);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"object" => {
                let attrs = attributes(&e)?;
                return Ok(ObjectMetadata {
                    id: parse_id(required(&attrs, "id")?)?,
                    size: parse_number(required(&attrs, "size")?, "size")?,
                    created: parse_time(required(&attrs, "created")?)?,
                    content_hash: required(&attrs, "contentHash")?.to_string(),
                    query_ready: parse_number(required(&attrs, "queryReady")?, "queryReady")?,
                });
            }
            Event::Eof => {
                return Err(EnvelopeError::Malformed("no <object> element".to_string()))
            }
            _ => {}
        }
    }
}

/// Element whose text content is being collected.
enum Capture {
    None,
    Field(String),
    Count,
    Cookie,
    Integrity,
}

pub fn decode_query_result(raw: &[u8]) -> EnvelopeResult<QueryResultEnvelope> {
    let mut reader = Reader::from_str(utf8(raw)?);
    let mut hits = Vec::new();
    let mut current: Option<Hit> = None;
    let mut capture = Capture::None;
    let mut text = String::new();
    let mut count = None;
    let mut cookie = None;
    let mut integrity_time = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                text.clear();
                match e.name().as_ref() {
                    b"hit" => {
                        let attrs = attributes(&e)?;
                        current = Some(Hit {
                            id: parse_id(required(&attrs, "id")?)?,
                            fields: BTreeMap::new(),
                        });
                    }
                    b"field" => {
                        let attrs = attributes(&e)?;
                        capture = Capture::Field(required(&attrs, "name")?.to_string());
                    }
                    b"count" => capture = Capture::Count,
                    b"cookie" => capture = Capture::Cookie,
                    b"integrityTime" => capture = Capture::Integrity,
                    _ => {}
                }
            }
            Event::Empty(e) => match e.name().as_ref() {
                b"hit" => {
                    let attrs = attributes(&e)?;
                    hits.push(Hit {
                        id: parse_id(required(&attrs, "id")?)?,
                        fields: BTreeMap::new(),
                    });
                }
                b"field" => {
                    let attrs = attributes(&e)?;
                    if let Some(hit) = current.as_mut() {
                        hit.fields
                            .insert(required(&attrs, "name")?.to_string(), String::new());
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                if !matches!(capture, Capture::None) {
                    text.push_str(&unescape(&t)?);
                }
            }
            Event::End(e) => {
                match (e.name().as_ref(), std::mem::replace(&mut capture, Capture::None)) {
                    (b"field", Capture::Field(name)) => {
                        if let Some(hit) = current.as_mut() {
                            hit.fields.insert(name, std::mem::take(&mut text));
                        }
                    }
                    (b"count", Capture::Count) => count = Some(parse_number(&text, "count")?),
                    (b"cookie", Capture::Cookie) => cookie = Some(decode_cookie(&text)?),
                    (b"integrityTime", Capture::Integrity) => {
                        integrity_time = Some(parse_time(&text)?)
                    }
                    (b"hit", _) => {
                        if let Some(hit) = current.take() {
                            hits.push(hit);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(QueryResultEnvelope {
        hits,
        terminal: QueryTerminal {
            count: count.ok_or_else(|| EnvelopeError::Malformed("missing <count>".to_string()))?,
            cookie,
            integrity_time: integrity_time
                .ok_or_else(|| EnvelopeError::Malformed("missing <integrityTime>".to_string()))?,
        },
    })
}

/// Child of `<query>` whose text is being collected.
enum QueryPart {
    None,
    Text,
    Param(String),
    Select,
    Key,
    Cookie,
}

/// Parse an XML query envelope sent as a request body.
pub fn parse_query_envelope(raw: &[u8]) -> EnvelopeResult<QueryEnvelope> {
    let mut reader = Reader::from_str(utf8(raw)?);
    let mut envelope = QueryEnvelope::default();
    let mut saw_root = false;
    let mut part = QueryPart::None;
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) if !saw_root => {
                if e.name().as_ref() != b"query" {
                    return Err(EnvelopeError::Malformed(format!(
                        "expected <query>, found <{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                saw_root = true;
                let attrs = attributes(&e)?;
                envelope.cache = attrs.get("cache").cloned();
                if let Some(max) = attrs.get("max") {
                    envelope.max_results = Some(parse_number(max, "max")?);
                }
            }
            Event::Start(e) => {
                text.clear();
                part = match e.name().as_ref() {
                    b"text" => QueryPart::Text,
                    b"param" => {
                        let attrs = attributes(&e)?;
                        QueryPart::Param(required(&attrs, "name")?.to_string())
                    }
                    b"select" => QueryPart::Select,
                    b"key" => QueryPart::Key,
                    b"cookie" => QueryPart::Cookie,
                    _ => QueryPart::None,
                };
            }
            Event::Text(t) => {
                if !matches!(part, QueryPart::None) {
                    text.push_str(&unescape(&t)?);
                }
            }
            Event::End(_) => {
                let value = std::mem::take(&mut text);
                match std::mem::replace(&mut part, QueryPart::None) {
                    QueryPart::Text => envelope.text = Some(value.trim().to_string()),
                    QueryPart::Param(name) => {
                        envelope.params.insert(name, value);
                    }
                    QueryPart::Select => envelope.select.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    ),
                    QueryPart::Key => envelope.key = Some(value.trim().to_string()),
                    QueryPart::Cookie => envelope.cookie = Some(decode_cookie(&value)?),
                    QueryPart::None => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(EnvelopeError::Malformed("empty query envelope".to_string()));
    }
    Ok(envelope)
}

//! Binary envelope format.
//!
//! ```text
//! query result : "QRY1" hit* end
//! hit          : 0x01 u16-len id, u16 field-count, (u16-len name, u32-len value)*
//! end          : 0x00 u64 count, u8 has-cookie [u16-len hex-cookie], i64 integrity-ms
//! object       : "OBJ1" u16-len id, u64 size, i64 created-ms, u16-len hash, u8 query-ready
//! ```
//!
//! All integers are big-endian.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};

use super::{
    decode_cookie, encode_cookie, EnvelopeError, EnvelopeResult, EnvelopeWriter,
    QueryResultEnvelope, QueryTerminal,
};
use crate::query::Hit;
use crate::storage::{ObjectId, ObjectMetadata};

const QUERY_MAGIC: &[u8; 4] = b"QRY1";
const OBJECT_MAGIC: &[u8; 4] = b"OBJ1";
const TAG_HIT: u8 = 0x01;
const TAG_END: u8 = 0x00;

/// Writer for the binary query-result form.
pub struct BinaryEnvelopeWriter;

impl EnvelopeWriter for BinaryEnvelopeWriter {
    fn open(&mut self, out: &mut BytesMut) -> EnvelopeResult<()> {
        out.put_slice(QUERY_MAGIC);
        Ok(())
    }

    fn hit(&mut self, out: &mut BytesMut, hit: &Hit) -> EnvelopeResult<()> {
        out.put_u8(TAG_HIT);
        put_short_str(out, hit.id.as_str())?;
        let count = u16::try_from(hit.fields.len())
            .map_err(|_| EnvelopeError::Malformed("too many fields in hit".to_string()))?;
        out.put_u16(count);
        for (name, value) in &hit.fields {
            put_short_str(out, name)?;
            let len = u32::try_from(value.len())
                .map_err(|_| EnvelopeError::Malformed(format!("field {} too long", name)))?;
            out.put_u32(len);
            out.put_slice(value.as_bytes());
        }
        Ok(())
    }

    fn close(&mut self, out: &mut BytesMut, terminal: &QueryTerminal) -> EnvelopeResult<()> {
        out.put_u8(TAG_END);
        out.put_u64(terminal.count);
        match &terminal.cookie {
            Some(cookie) => {
                out.put_u8(1);
                put_short_str(out, &encode_cookie(cookie))?;
            }
            None => out.put_u8(0),
        }
        out.put_i64(terminal.integrity_time.timestamp_millis());
        Ok(())
    }
}

pub fn encode_object(out: &mut BytesMut, meta: &ObjectMetadata) {
    out.put_slice(OBJECT_MAGIC);
    // Ids and hashes are short ASCII strings, always within u16.
    out.put_u16(meta.id.as_str().len() as u16);
    out.put_slice(meta.id.as_str().as_bytes());
    out.put_u64(meta.size);
    out.put_i64(meta.created.timestamp_millis());
    out.put_u16(meta.content_hash.len() as u16);
    out.put_slice(meta.content_hash.as_bytes());
    out.put_u8(meta.query_ready as u8);
}

pub fn decode_object(mut raw: &[u8]) -> EnvelopeResult<ObjectMetadata> {
    expect_magic(&mut raw, OBJECT_MAGIC)?;
    let id = take_object_id(&mut raw)?;
    let size = take_u64(&mut raw)?;
    let created = take_time(&mut raw)?;
    let content_hash = take_short_str(&mut raw)?;
    let query_ready = take_u8(&mut raw)? != 0;
    Ok(ObjectMetadata {
        id,
        size,
        created,
        content_hash,
        query_ready,
    })
}

pub fn decode_query_result(mut raw: &[u8]) -> EnvelopeResult<QueryResultEnvelope> {
    expect_magic(&mut raw, QUERY_MAGIC)?;
    let mut hits = Vec::new();
    loop {
        match take_u8(&mut raw)? {
            TAG_HIT => {
                let id = take_object_id(&mut raw)?;
                let count = take_u16(&mut raw)?;
                let mut fields = BTreeMap::new();
                for _ in 0..count {
                    let name = take_short_str(&mut raw)?;
                    let len = take_u32(&mut raw)? as usize;
                    let value = take_str(&mut raw, len)?;
                    fields.insert(name, value);
                }
                hits.push(Hit { id, fields });
            }
            TAG_END => break,
            tag => {
                return Err(EnvelopeError::Malformed(format!(
                    "unknown record tag 0x{:02x}",
                    tag
                )))
            }
        }
    }
    let count = take_u64(&mut raw)?;
    let cookie = match take_u8(&mut raw)? {
        0 => None,
        _ => Some(decode_cookie(&take_short_str(&mut raw)?)?),
    };
    let integrity_time = take_time(&mut raw)?;
    Ok(QueryResultEnvelope {
        hits,
        terminal: QueryTerminal {
            count,
            cookie,
            integrity_time,
        },
    })
}

fn put_short_str(out: &mut BytesMut, value: &str) -> EnvelopeResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| EnvelopeError::Malformed("string exceeds 65535 bytes".to_string()))?;
    out.put_u16(len);
    out.put_slice(value.as_bytes());
    Ok(())
}

fn need(raw: &[u8], n: usize) -> EnvelopeResult<()> {
    if raw.len() < n {
        return Err(EnvelopeError::Malformed("truncated envelope".to_string()));
    }
    Ok(())
}

fn expect_magic(raw: &mut &[u8], magic: &[u8; 4]) -> EnvelopeResult<()> {
    need(raw, magic.len())?;
    if &raw[..magic.len()] != magic {
        return Err(EnvelopeError::Malformed("bad magic".to_string()));
    }
    raw.advance(magic.len());
    Ok(())
}

fn take_u8(raw: &mut &[u8]) -> EnvelopeResult<u8> {
    need(raw, 1)?;
    Ok(raw.get_u8())
}

fn take_u16(raw: &mut &[u8]) -> EnvelopeResult<u16> {
    need(raw, 2)?;
    Ok(raw.get_u16())
}

fn take_u32(raw: &mut &[u8]) -> EnvelopeResult<u32> {
    need(raw, 4)?;
    Ok(raw.get_u32())
}

fn take_u64(raw: &mut &[u8]) -> EnvelopeResult<u64> {
    need(raw, 8)?;
    Ok(raw.get_u64())
}

fn take_time(raw: &mut &[u8]) -> EnvelopeResult<DateTime<Utc>> {
    need(raw, 8)?;
    let millis = raw.get_i64();
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| EnvelopeError::Malformed(format!("timestamp {} out of range", millis)))
}

fn take_str(raw: &mut &[u8], len: usize) -> EnvelopeResult<String> {
    need(raw, len)?;
    let value = std::str::from_utf8(&raw[..len])
        .map_err(|_| EnvelopeError::Malformed("string is not UTF-8".to_string()))?
        .to_string();
    raw.advance(len);
    Ok(value)
}

fn take_short_str(raw: &mut &[u8]) -> EnvelopeResult<String> {
    let len = take_u16(raw)? as usize;
    take_str(raw, len)
}

fn take_object_id(raw: &mut &[u8]) -> EnvelopeResult<ObjectId> {
    let id = take_short_str(raw)?;
    ObjectId::parse(&id).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

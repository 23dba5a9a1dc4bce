//! Byte-range header parsing.
//!
//! Accepts `[bytes=]first-[last]`. An empty first position means offset 0;
//! suffix ranges ("last N bytes") are not recognised.

use thiserror::Error;

/// A parsed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub offset: u64,
    /// `None` reads to the end of the object.
    pub length: Option<u64>,
}

impl Range {
    /// Range covering the whole object.
    pub const FULL: Range = Range {
        offset: 0,
        length: None,
    };

    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// `content-range` value announced before streaming. Only bounded ranges
    /// can be described up front.
    pub fn content_range(&self) -> Option<String> {
        let len = self.length.filter(|len| *len > 0)?;
        let last = self.offset.checked_add(len - 1)?;
        Some(format!("bytes {}-{}/*", self.offset, last))
    }

    /// Whether this range asks for less than the whole object.
    pub fn is_partial(&self) -> bool {
        *self != Self::FULL
    }
}

/// Failure to parse a range expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range '{0}'")]
    InvalidRange(String),
}

/// Parse a `Range` header value. `None` yields [`Range::FULL`].
pub fn parse_range(header: Option<&str>) -> Result<Range, RangeError> {
    let Some(raw) = header else {
        return Ok(Range::FULL);
    };
    let invalid = || RangeError::InvalidRange(raw.to_string());

    let spec = raw.trim();
    let spec = spec.strip_prefix("bytes=").unwrap_or(spec);
    let (first, last) = spec.split_once('-').ok_or_else(invalid)?;
    let (first, last) = (first.trim(), last.trim());

    let offset = if first.is_empty() {
        0
    } else {
        first.parse::<u64>().map_err(|_| invalid())?
    };

    let length = if last.is_empty() {
        None
    } else {
        let last = last.parse::<u64>().map_err(|_| invalid())?;
        // Negative lengths and a length past u64::MAX are both invalid.
        let span = last.checked_sub(offset).ok_or_else(invalid)?;
        Some(span.checked_add(1).ok_or_else(invalid)?)
    };

    Ok(Range { offset, length })
}

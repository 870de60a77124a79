//! Cache entry model and its on-disk record format
//!
//! A record is laid out as:
//!
//! ```text
//! [i64 timestamp][u64 len][content-type][u64 len][content-encoding][u64 len][etag][u64 len][content]
//! ```
//!
//! All integers are little-endian so cache directories can be moved between
//! machines.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Upper bound for the header-like string fields of a record.
pub const MAX_META_FIELD_BYTES: usize = 16 * 1024;

/// A cached response body together with the headers needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub content: Bytes,
    pub content_type: String,
    pub content_encoding: String,
    pub etag: String,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(content: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: content_type.into(),
            content_encoding: String::new(),
            etag: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = encoding.into();
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }

    /// Age in whole seconds relative to `now`, clamped at zero for clock skew.
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.timestamp).num_seconds().max(0) as u64
    }

    pub fn encode(&self) -> Bytes {
        let len = 8
            + 4 * 8
            + self.content_type.len()
            + self.content_encoding.len()
            + self.etag.len()
            + self.content.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_i64_le(self.timestamp.timestamp());
        put_field(&mut buf, self.content_type.as_bytes());
        put_field(&mut buf, self.content_encoding.as_bytes());
        put_field(&mut buf, self.etag.as_bytes());
        put_field(&mut buf, &self.content);
        buf.freeze()
    }

    /// Decode a record, rejecting short reads, oversized fields and trailing bytes.
    pub fn decode(mut data: &[u8], max_content_bytes: usize) -> Result<Self, DecodeError> {
        if data.remaining() < 8 {
            return Err(DecodeError::Truncated);
        }
        let secs = data.get_i64_le();
        let timestamp = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or(DecodeError::InvalidTimestamp(secs))?;

        let content_type = take_string(&mut data, "content-type")?;
        let content_encoding = take_string(&mut data, "content-encoding")?;
        let etag = take_string(&mut data, "etag")?;
        let content = take_field(&mut data, max_content_bytes, "content")?;

        if data.has_remaining() {
            return Err(DecodeError::TrailingBytes(data.remaining()));
        }

        Ok(Self {
            content: Bytes::copy_from_slice(content),
            content_type,
            content_encoding,
            etag,
            timestamp,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record is truncated")]
    Truncated,
    #[error("{field} length {len} exceeds limit of {limit} bytes")]
    FieldTooLarge {
        field: &'static str,
        len: u64,
        limit: usize,
    },
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("{0} unexpected bytes after record")]
    TrailingBytes(usize),
}

fn put_field(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u64_le(value.len() as u64);
    buf.put_slice(value);
}

fn take_field<'a>(
    data: &mut &'a [u8],
    limit: usize,
    field: &'static str,
) -> Result<&'a [u8], DecodeError> {
    if data.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    let len = data.get_u64_le();
    if len > limit as u64 {
        return Err(DecodeError::FieldTooLarge { field, len, limit });
    }
    let len = len as usize;
    let remaining: &'a [u8] = *data;
    if remaining.len() < len {
        return Err(DecodeError::Truncated);
    }
    let (value, rest) = remaining.split_at(len);
    *data = rest;
    Ok(value)
}

fn take_string(data: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    let raw = take_field(data, MAX_META_FIELD_BYTES, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}

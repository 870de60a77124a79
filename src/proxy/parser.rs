//! Request head tokenizer and target resolution
//!
//! One parser serves both the tunnel and the forwarding paths. It accepts
//! three request-target shapes:
//!
//! - `CONNECT host[:port]` (authority-form, default port 443)
//! - `GET http://host[:port]/path` (absolute-form, default port 80)
//! - `GET /path` with a `Host` header (origin-form)
//!
//! Anything else, `https://` absolute targets included, is rejected.

use http::Method;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_CONNECT_PORT: u16 = 443;
pub const CACHE_POPULATE_PATH: &str = "/cache/populate";

const MAX_HEADER_COUNT: usize = 128;
const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("connection closed before headers completed")]
    ConnectionClosed,
    #[error("HTTP headers exceed allowed size of {0} bytes")]
    HeadersTooLarge(usize),
    #[error("partial HTTP message")]
    Incomplete,
    #[error("malformed HTTP message: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("unsupported request target {0:?}")]
    UnsupportedTarget(String),
    #[error("missing Host header for origin-form request")]
    MissingHost,
    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body of {len} bytes exceeds limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },
    #[error("connection closed after {received} of {expected} body bytes")]
    Incomplete { expected: usize, received: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the request named its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    Authority,
    Absolute,
    Origin,
}

/// Header list in arrival order. Lookups are case-insensitive and the last
/// occurrence of a name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared `Content-Length`, if any.
    pub fn content_length(&self) -> Result<Option<usize>, ParseError> {
        match self.get("content-length") {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| ParseError::InvalidContentLength(raw.to_string())),
        }
    }

    fn from_httparse(headers: &[httparse::Header<'_>]) -> Self {
        let entries = headers
            .iter()
            .map(|h| {
                let value = String::from_utf8_lossy(h.value).trim_matches(' ').to_string();
                (h.name.to_string(), value)
            })
            .collect();
        Self { entries }
    }
}

/// A request head resolved to a concrete destination.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub form: TargetForm,
    pub target: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: Headers,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// `POST /cache/populate` addressed to the proxy itself.
    pub fn is_cache_populate(&self) -> bool {
        self.method == Method::POST
            && self.form == TargetForm::Origin
            && self.path == CACHE_POPULATE_PATH
    }
}

/// Parse a complete request head (through the blank line).
pub fn parse_request(head: &[u8]) -> Result<ParsedRequest, ParseError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    if req.parse(head)?.is_partial() {
        return Err(ParseError::Incomplete);
    }

    let method_str = req.method.ok_or(ParseError::Incomplete)?;
    let target = req.path.ok_or(ParseError::Incomplete)?.to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| ParseError::InvalidMethod(method_str.to_string()))?;
    let headers = Headers::from_httparse(req.headers);

    let (form, host, port, path) = resolve_target(&method, &target, &headers)?;

    Ok(ParsedRequest {
        method,
        form,
        target,
        version,
        host,
        port,
        path,
        headers,
    })
}

fn resolve_target(
    method: &Method,
    target: &str,
    headers: &Headers,
) -> Result<(TargetForm, String, u16, String), ParseError> {
    if *method == Method::CONNECT {
        let (host, port) = split_host_and_port(target);
        if host.is_empty() {
            return Err(ParseError::UnsupportedTarget(target.to_string()));
        }
        return Ok((
            TargetForm::Authority,
            host,
            port.unwrap_or(DEFAULT_CONNECT_PORT),
            "/".to_string(),
        ));
    }

    if let Some(rest) = strip_prefix_ignore_case(target, "http://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (host, port) = split_host_and_port(authority);
        if host.is_empty() {
            return Err(ParseError::UnsupportedTarget(target.to_string()));
        }
        return Ok((
            TargetForm::Absolute,
            host,
            port.unwrap_or(DEFAULT_HTTP_PORT),
            path,
        ));
    }

    if target.starts_with('/') {
        let host_header = headers.get("host").ok_or(ParseError::MissingHost)?;
        let (host, port) = split_host_and_port(host_header);
        if host.is_empty() {
            return Err(ParseError::MissingHost);
        }
        return Ok((
            TargetForm::Origin,
            host,
            port.unwrap_or(DEFAULT_HTTP_PORT),
            target.to_string(),
        ));
    }

    Err(ParseError::UnsupportedTarget(target.to_string()))
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Split a trailing `:port`. A suffix that is not a valid port stays part of the host.
pub(crate) fn split_host_and_port(input: &str) -> (String, Option<u16>) {
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(parsed) = port.parse::<u16>() {
            return (host.to_string(), Some(parsed));
        }
    }
    (input.to_string(), None)
}

/// Read until `\r\n\r\n`. Returns the head (terminator included) and any
/// bytes that arrived after it.
pub async fn read_message_head<S>(
    stream: &mut S,
    max_header_bytes: usize,
) -> Result<(Vec<u8>, Vec<u8>), ParseError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let bytes_read = stream.read(&mut temp).await?;
        if bytes_read == 0 {
            return Err(ParseError::ConnectionClosed);
        }
        buffer.extend_from_slice(&temp[..bytes_read]);

        if let Some(pos) = find_header_end(&buffer) {
            if pos > max_header_bytes {
                return Err(ParseError::HeadersTooLarge(max_header_bytes));
            }
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }

        if buffer.len() > max_header_bytes {
            return Err(ParseError::HeadersTooLarge(max_header_bytes));
        }
    }
}

/// Read exactly `expected` body bytes, starting with whatever already
/// arrived with the head.
pub async fn read_body<S>(
    stream: &mut S,
    mut buffered: Vec<u8>,
    expected: usize,
    limit: usize,
) -> Result<Vec<u8>, BodyError>
where
    S: AsyncRead + Unpin,
{
    if expected > limit {
        return Err(BodyError::TooLarge {
            len: expected,
            limit,
        });
    }

    buffered.truncate(expected);
    let mut body = buffered;
    body.reserve(expected - body.len());

    let mut chunk = vec![0u8; READ_CHUNK];
    while body.len() < expected {
        let want = (expected - body.len()).min(chunk.len());
        let read = stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(BodyError::Incomplete {
                expected,
                received: body.len(),
            });
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Ok(body)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

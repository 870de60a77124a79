//! Per-connection request handling
//!
//! Every connection carries exactly one request. The handler reads and
//! classifies it, then takes one of three paths:
//!
//! - `POST /cache/populate` seeds the disk cache directly
//! - `CONNECT` opens a byte tunnel
//! - anything else is remapped, served from cache, or forwarded and cached

use crate::cache::{cache_key, CacheEntry, DiskCache};
use crate::config::ProxyConfig;
use crate::proxy::parser::{
    parse_request, read_body, read_message_head, BodyError, Headers, ParsedRequest,
};
use crate::proxy::remap::RemapTable;
use crate::proxy::tunnel::relay;
use crate::proxy::upstream::{connect_upstream, UpstreamTarget};
use anyhow::anyhow;
use bytes::Bytes;
use chrono::Utc;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const VIA_HEADER_VALUE: &str = "1.1 edgeproxy";

const MAX_RESPONSE_HEADER_COUNT: usize = 128;
const FORWARD_CHUNK: usize = 16 * 1024;
const POPULATE_REQUIRED_HEADERS: [&str; 4] = ["Host", "Target-Path", "Content-Type", "Content-Length"];

/// Hop-by-hop headers that are not forwarded upstream.
const SKIPPED_REQUEST_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
];

/// Shared, read-only state every connection handler needs.
#[derive(Debug)]
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub remap: RemapTable,
    pub cache: DiskCache,
}

/// Serve one client connection to completion.
///
/// Malformed requests, and clients that do not finish their request head within
/// `request_head_timeout_ms`, are dropped without a response. Errors that reach
/// the caller are I/O failures after the exchange started.
pub async fn handle_connection<S>(client: &mut S, ctx: &ProxyContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let deadline = ctx.config.request_head_timeout();
    let (head, leftover) =
        match timeout(deadline, read_message_head(client, ctx.config.max_header_bytes)).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => {
                tracing::debug!("Dropping connection before a request arrived: {err}");
                return Ok(());
            }
            Err(_) => {
                tracing::debug!("No request head within {:?}; closing", deadline);
                return Ok(());
            }
        };

    let request = match parse_request(&head) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!("Rejecting request: {err}");
            return Ok(());
        }
    };

    tracing::info!(
        "{} {} -> {}:{}{}",
        request.method,
        request.target,
        request.host,
        request.port,
        request.path
    );

    if request.is_cache_populate() {
        return populate_cache(client, &request, leftover, ctx).await;
    }
    if request.is_connect() {
        return handle_connect(client, &request, leftover, ctx).await;
    }
    handle_http(client, request, leftover, ctx).await
}

async fn populate_cache<S>(
    client: &mut S,
    request: &ParsedRequest,
    leftover: Vec<u8>,
    ctx: &ProxyContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let missing: Vec<&str> = POPULATE_REQUIRED_HEADERS
        .iter()
        .copied()
        .filter(|name| !request.headers.contains(name))
        .collect();
    if !missing.is_empty() {
        let message = format!("Missing required headers: {}", missing.join(", "));
        tracing::warn!("Cache populate rejected: {message}");
        return respond_with_status(client, StatusCode::BAD_REQUEST, &message).await;
    }

    let expected = match request.headers.content_length() {
        Ok(Some(len)) => len,
        Ok(None) | Err(_) => {
            return respond_with_status(client, StatusCode::BAD_REQUEST, "Invalid Content-Length")
                .await;
        }
    };

    let deadline = ctx.config.request_head_timeout();
    let read = read_body(client, leftover, expected, ctx.config.max_cached_body_bytes);
    let body = match timeout(deadline, read).await {
        Ok(Ok(body)) => body,
        Ok(Err(err @ BodyError::TooLarge { .. })) => {
            tracing::warn!("Cache populate rejected: {err}");
            return respond_with_status(client, StatusCode::PAYLOAD_TOO_LARGE, &err.to_string())
                .await;
        }
        Ok(Err(err)) => {
            tracing::warn!("Cache populate rejected: {err}");
            return respond_with_status(client, StatusCode::BAD_REQUEST, "Incomplete body").await;
        }
        Err(_) => {
            tracing::warn!("Cache populate body not received within {:?}", deadline);
            return respond_with_status(client, StatusCode::REQUEST_TIMEOUT, "Body timed out")
                .await;
        }
    };

    let headers = &request.headers;
    let target_path = headers.get("target-path").unwrap_or("/");
    let key = cache_key(&request.host, target_path);
    let entry = CacheEntry::new(body, headers.get("content-type").unwrap_or_default())
        .with_content_encoding(headers.get("content-encoding").unwrap_or_default())
        .with_etag(headers.get("etag").unwrap_or_default());

    match ctx.cache.store(&key, &entry).await {
        Ok(()) => {
            tracing::info!("Populated cache for {} ({} bytes)", key, entry.content.len());
            respond_with_status(client, StatusCode::OK, &format!("Cached {key}")).await
        }
        Err(err) => {
            tracing::error!("Failed to populate cache for {}: {:#}", key, err);
            respond_with_status(
                client,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to write cache entry",
            )
            .await
        }
    }
}

async fn handle_connect<S>(
    client: &mut S,
    request: &ParsedRequest,
    leftover: Vec<u8>,
    ctx: &ProxyContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = UpstreamTarget::new(&request.host, request.port);
    let mut upstream = match connect_upstream(&target, ctx.config.connect_timeout()).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!("Failed to establish CONNECT tunnel to {} - {:#}", target, err);
            return respond_with_status(
                client,
                StatusCode::BAD_GATEWAY,
                "Unable to reach upstream server",
            )
            .await;
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection established\r\nProxy-Agent: edgeproxy\r\n\r\n")
        .await?;
    client.flush().await?;

    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
    }

    let stats = relay(client, &mut upstream, ctx.config.tunnel_idle_timeout()).await;
    tracing::info!(
        "Tunnel to {} closed ({} bytes up, {} bytes down)",
        target,
        stats.client_to_upstream + leftover.len() as u64,
        stats.upstream_to_client
    );
    Ok(())
}

async fn handle_http<S>(
    client: &mut S,
    request: ParsedRequest,
    leftover: Vec<u8>,
    ctx: &ProxyContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut target = UpstreamTarget::new(&request.host, request.port);
    let mut path = request.path.clone();
    if let Some(remapped) = ctx.remap.remap(&target.host, target.port, &path) {
        target = UpstreamTarget::new(remapped.host, remapped.port);
        path = remapped.path;
    }

    if request.headers.contains("transfer-encoding") && !request.headers.contains("content-length")
    {
        tracing::warn!("Rejecting request with chunked body for {}{}", target.host, path);
        return Ok(());
    }

    let deadline = ctx.config.request_head_timeout();
    let body = match request.headers.content_length() {
        Ok(Some(len)) => {
            let read = read_body(client, leftover, len, ctx.config.max_request_body_bytes);
            match timeout(deadline, read).await {
                Ok(Ok(body)) => body,
                Ok(Err(err)) => {
                    tracing::warn!("Rejecting request body: {err}");
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!("Request body not received within {:?}; closing", deadline);
                    return Ok(());
                }
            }
        }
        Ok(None) => Vec::new(),
        Err(err) => {
            tracing::warn!("Rejecting request: {err}");
            return Ok(());
        }
    };

    let key = cache_key(&target.host, &path);
    let cacheable = request.method == Method::GET;

    if cacheable {
        if let Some(entry) = ctx.cache.get(&key).await {
            let age = entry.age_secs(Utc::now());
            let fresh = ctx
                .config
                .cache_ttl()
                .map_or(true, |ttl| age < ttl.as_secs());
            if fresh {
                tracing::info!("Cache hit for {} (age: {} seconds)", key, age);
                return serve_cached(client, &entry, age, ctx.config.cache_headers).await;
            }
            tracing::info!("Cache entry for {} expired (age: {} seconds)", key, age);
        } else {
            tracing::info!("Cache miss for {}", key);
        }
    }

    let mut upstream = match connect_upstream(&target, ctx.config.connect_timeout()).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!("Failed to connect to upstream {} - {:#}", target, err);
            return respond_with_status(
                client,
                StatusCode::BAD_GATEWAY,
                "Unable to reach upstream server",
            )
            .await;
        }
    };

    let outbound = build_upstream_request(&request, &target, &path, &body);
    upstream.write_all(&outbound).await?;
    upstream.flush().await?;

    let read = read_message_head(&mut upstream, ctx.config.max_header_bytes);
    let (raw_head, prefix) = match timeout(deadline, read).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(err)) => {
            tracing::error!("Failed to read response head from {}: {err}", target);
            return respond_with_status(client, StatusCode::BAD_GATEWAY, "Failed to read response")
                .await;
        }
        Err(_) => {
            tracing::error!("No response head from {} within {:?}", target, deadline);
            return respond_with_status(
                client,
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream response timed out",
            )
            .await;
        }
    };
    let response = match ResponseHead::parse(&raw_head) {
        Ok(head) => head,
        Err(err) => {
            tracing::error!("Invalid response head from {}: {err:#}", target);
            return respond_with_status(client, StatusCode::BAD_GATEWAY, "Invalid upstream response")
                .await;
        }
    };

    let forwarded_head = if ctx.config.cache_headers {
        augment_head(&raw_head, &[("X-Cache", "MISS"), ("Via", VIA_HEADER_VALUE)])
    } else {
        raw_head
    };
    client.write_all(&forwarded_head).await?;

    let is_chunked = response
        .headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let declared = if is_chunked {
        None
    } else {
        response.headers.content_length().ok().flatten()
    };
    let capture_limit = match declared {
        Some(len)
            if cacheable
                && response.status == StatusCode::OK
                && len <= ctx.config.max_cached_body_bytes =>
        {
            Some(len)
        }
        _ => None,
    };

    let received = forward_body(
        &mut upstream,
        client,
        prefix,
        declared,
        capture_limit,
    )
    .await?;
    client.flush().await?;

    match (declared, received.captured) {
        (Some(len), Some(content)) if received.bytes == len => {
            let headers = &response.headers;
            let entry = CacheEntry::new(
                Bytes::from(content),
                headers.get("content-type").unwrap_or_default(),
            )
            .with_content_encoding(headers.get("content-encoding").unwrap_or_default())
            .with_etag(headers.get("etag").unwrap_or_default());
            ctx.cache.put(&key, &entry).await;
        }
        (Some(len), _) if received.bytes < len => {
            tracing::warn!(
                "Upstream {} closed after {} of {} body bytes; not caching {}",
                target,
                received.bytes,
                len,
                key
            );
        }
        _ => tracing::debug!(
            "Forwarded {} body bytes for {} without caching (status {})",
            received.bytes,
            key,
            response.status
        ),
    }

    Ok(())
}

struct ForwardedBody {
    bytes: usize,
    captured: Option<Vec<u8>>,
}

/// Stream the response body to the client. With a declared length, stops
/// once that many bytes have moved; otherwise runs to upstream EOF.
async fn forward_body<U, C>(
    upstream: &mut U,
    client: &mut C,
    mut prefix: Vec<u8>,
    declared: Option<usize>,
    capture_limit: Option<usize>,
) -> anyhow::Result<ForwardedBody>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut captured = capture_limit.map(Vec::with_capacity);
    if let Some(len) = declared {
        prefix.truncate(len);
    }

    let mut total = prefix.len();
    if !prefix.is_empty() {
        client.write_all(&prefix).await?;
        if let Some(buf) = captured.as_mut() {
            buf.extend_from_slice(&prefix);
        }
    }

    let mut chunk = vec![0u8; FORWARD_CHUNK];
    loop {
        let want = match declared {
            Some(len) if total >= len => break,
            Some(len) => (len - total).min(chunk.len()),
            None => chunk.len(),
        };
        let read = upstream.read(&mut chunk[..want]).await?;
        if read == 0 {
            break;
        }
        client.write_all(&chunk[..read]).await?;
        if let Some(buf) = captured.as_mut() {
            buf.extend_from_slice(&chunk[..read]);
        }
        total += read;
    }

    Ok(ForwardedBody {
        bytes: total,
        captured,
    })
}

fn build_upstream_request(
    request: &ParsedRequest,
    target: &UpstreamTarget,
    path: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(512 + body.len());
    out.extend_from_slice(format!("{} {} {}\r\n", request.method, path, request.version).as_bytes());

    let host_value = if target.port == crate::proxy::parser::DEFAULT_HTTP_PORT {
        target.host.clone()
    } else {
        target.to_string()
    };
    out.extend_from_slice(format!("Host: {host_value}\r\n").as_bytes());

    for (name, value) in request.headers.iter() {
        if SKIPPED_REQUEST_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

struct ResponseHead {
    status: StatusCode,
    headers: Headers,
}

impl ResponseHead {
    fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADER_COUNT];
        let mut res = httparse::Response::new(&mut header_storage);
        if res.parse(raw)?.is_partial() {
            return Err(anyhow!("partial HTTP response"));
        }
        let code = res.code.ok_or_else(|| anyhow!("missing status code"))?;
        let status = StatusCode::from_u16(code)?;
        let mut headers = Headers::default();
        for h in res.headers.iter() {
            headers.push(h.name, String::from_utf8_lossy(h.value).trim().to_string());
        }
        Ok(Self { status, headers })
    }
}

/// Insert extra header lines just before the blank line ending `head`.
fn augment_head(head: &[u8], extra: &[(&str, &str)]) -> Vec<u8> {
    let body_start = head.len().saturating_sub(2);
    let mut out = Vec::with_capacity(head.len() + 64);
    out.extend_from_slice(&head[..body_start]);
    for (name, value) in extra {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

async fn serve_cached<W>(
    client: &mut W,
    entry: &CacheEntry,
    age: u64,
    cache_headers: bool,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = String::from("HTTP/1.1 200 OK\r\n");
    if !entry.content_type.is_empty() {
        head.push_str(&format!("Content-Type: {}\r\n", entry.content_type));
    }
    if !entry.content_encoding.is_empty() {
        head.push_str(&format!("Content-Encoding: {}\r\n", entry.content_encoding));
    }
    head.push_str(&format!("Content-Length: {}\r\n", entry.content.len()));
    if !entry.etag.is_empty() {
        head.push_str(&format!("ETag: {}\r\n", entry.etag));
    }
    if cache_headers {
        head.push_str("X-Cache: HIT\r\n");
        head.push_str(&format!("X-Cache-Age: {age}\r\n"));
        head.push_str(&format!("Via: {VIA_HEADER_VALUE}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");

    client.write_all(head.as_bytes()).await?;
    client.write_all(&entry.content).await?;
    client.flush().await?;
    Ok(())
}

pub(crate) async fn respond_with_status<W>(
    stream: &mut W,
    status: StatusCode,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::remap::RemapTable;
    use crate::proxy::upstream::{
        reset_test_upstream_connector, set_test_upstream_connector, UpstreamStream,
    };
    use serial_test::serial;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::duplex;

    fn context(dir: &tempfile::TempDir, remap: &str) -> ProxyContext {
        ProxyContext {
            config: ProxyConfig::default(),
            remap: RemapTable::parse(remap),
            cache: DiskCache::new(dir.path().join("cache"), 1024 * 1024),
        }
    }

    /// Run one request through `handle_connection` and return the raw response.
    async fn exchange(ctx: &ProxyContext, request: &[u8]) -> String {
        let (mut client, mut server) = duplex(64 * 1024);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        handle_connection(&mut server, ctx)
            .await
            .expect("handler succeeds");
        drop(server);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    /// Install a connector that records targets and answers each connection
    /// with the next canned response.
    fn fake_upstream(responses: Vec<&'static [u8]>) -> Arc<Mutex<Vec<(UpstreamTarget, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(responses));
        set_test_upstream_connector({
            let seen = seen.clone();
            move |target: &UpstreamTarget| {
                let target = target.clone();
                let seen = seen.clone();
                let next = {
                    let mut queue = queue.lock().unwrap();
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                };
                async move {
                    let Some(response) = next else {
                        return Err(anyhow!("unexpected upstream connection"));
                    };
                    let (proxy_side, mut upstream_side) = duplex(64 * 1024);
                    tokio::spawn(async move {
                        let (head, _) = read_message_head(&mut upstream_side, 64 * 1024)
                            .await
                            .unwrap();
                        seen.lock()
                            .unwrap()
                            .push((target, String::from_utf8_lossy(&head).to_string()));
                        upstream_side.write_all(response).await.unwrap();
                    });
                    Ok(UpstreamStream::Mock(proxy_side))
                }
            }
        });
        seen
    }

    #[tokio::test]
    #[serial]
    async fn miss_then_hit_contacts_upstream_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let seen = fake_upstream(vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nETag: \"abc\"\r\nContent-Length: 5\r\n\r\nhello",
        ]);

        let request = b"GET http://origin.example/greeting HTTP/1.1\r\nHost: origin.example\r\n\r\n";
        let first = exchange(&ctx, request).await;
        assert!(first.starts_with("HTTP/1.1 200 OK"));
        assert!(first.contains("X-Cache: MISS"));
        assert!(first.ends_with("hello"));

        let second = exchange(&ctx, request).await;
        assert!(second.contains("X-Cache: HIT"));
        let age: u64 = second
            .lines()
            .find_map(|line| line.strip_prefix("X-Cache-Age: "))
            .expect("hit carries X-Cache-Age")
            .parse()
            .unwrap();
        assert!(age <= 5);
        assert!(second.contains("Via: 1.1 edgeproxy"));
        assert!(second.contains("Content-Type: text/plain"));
        assert!(second.contains("ETag: \"abc\""));
        assert!(second.contains("Content-Length: 5"));
        assert!(second.ends_with("hello"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, UpstreamTarget::new("origin.example", 80));
        assert!(seen[0].1.starts_with("GET /greeting HTTP/1.1\r\n"));
        assert!(seen[0].1.contains("Connection: close"));
        drop(seen);
        reset_test_upstream_connector();
    }

    #[tokio::test]
    #[serial]
    async fn short_body_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let _seen = fake_upstream(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"]);

        let response = exchange(
            &ctx,
            b"GET http://short.example/x HTTP/1.1\r\nHost: short.example\r\n\r\n",
        )
        .await;
        assert!(response.ends_with("abc"));
        assert!(ctx.cache.get("short.example/x").await.is_none());
        reset_test_upstream_connector();
    }

    #[tokio::test]
    #[serial]
    async fn non_200_responses_are_forwarded_but_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let _seen = fake_upstream(vec![b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope"]);

        let response = exchange(
            &ctx,
            b"GET http://missing.example/x HTTP/1.1\r\nHost: missing.example\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
        assert!(ctx.cache.get("missing.example/x").await.is_none());
        reset_test_upstream_connector();
    }

    #[tokio::test]
    #[serial]
    async fn remapped_request_is_forwarded_and_cached_under_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "map http://old.example/ http://new.example/api/\n");
        let seen = fake_upstream(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"]);

        let response = exchange(
            &ctx,
            b"GET http://old.example/ HTTP/1.1\r\nHost: old.example\r\n\r\n",
        )
        .await;
        assert!(response.ends_with("ok"));

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen[0].0, UpstreamTarget::new("new.example", 80));
            assert!(seen[0].1.starts_with("GET /api/ HTTP/1.1\r\n"));
            assert!(seen[0].1.contains("Host: new.example\r\n"));
        }
        assert!(ctx.cache.get("new.example/api/").await.is_some());
        assert!(ctx.cache.get("old.example/").await.is_none());
        reset_test_upstream_connector();
    }

    #[tokio::test]
    #[serial]
    async fn populate_then_get_skips_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let seen = fake_upstream(Vec::new());

        let response = exchange(
            &ctx,
            b"POST /cache/populate HTTP/1.1\r\nHost: x\r\nTarget-Path: /y\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

        let response = exchange(&ctx, b"GET http://x/y HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.contains("X-Cache: HIT"));
        assert!(response.ends_with("hello"));
        assert!(seen.lock().unwrap().is_empty());
        reset_test_upstream_connector();
    }

    #[tokio::test]
    async fn populate_without_required_headers_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let response = exchange(
            &ctx,
            b"POST /cache/populate HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\n\r\na",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(response.contains("Target-Path"));
        assert!(response.contains("Content-Type"));
    }

    #[tokio::test]
    async fn populate_with_short_body_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let response = exchange(
            &ctx,
            b"POST /cache/populate HTTP/1.1\r\nHost: x\r\nTarget-Path: /y\r\nContent-Type: a/b\r\nContent-Length: 50\r\n\r\nshort",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(ctx.cache.get("x/y").await.is_none());
    }

    #[tokio::test]
    async fn populate_over_cache_ceiling_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, "");
        ctx.config.max_cached_body_bytes = 4;
        let response = exchange(
            &ctx,
            b"POST /cache/populate HTTP/1.1\r\nHost: x\r\nTarget-Path: /big\r\nContent-Type: a/b\r\nContent-Length: 10\r\n\r\n0123456789",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large"), "{response}");
        assert!(ctx.cache.get("x/big").await.is_none());
    }

    #[tokio::test]
    async fn populate_write_failure_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let ctx = ProxyContext {
            config: ProxyConfig::default(),
            remap: RemapTable::default(),
            cache: DiskCache::new(blocked.clone(), 1024),
        };
        let response = exchange(
            &ctx,
            b"POST /cache/populate HTTP/1.1\r\nHost: x\r\nTarget-Path: /y\r\nContent-Type: a/b\r\nContent-Length: 2\r\n\r\nhi",
        )
        .await;
        assert!(
            response.starts_with("HTTP/1.1 500 Internal Server Error"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_head_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, "");
        ctx.config.request_head_timeout_ms = 50;

        // Stays open and never sends a byte.
        let (mut client, mut server) = duplex(1024);
        tokio::time::timeout(Duration::from_secs(2), handle_connection(&mut server, &ctx))
            .await
            .expect("handler gives up on a silent client")
            .unwrap();
        drop(server);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn stalled_populate_body_is_408() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, "");
        ctx.config.request_head_timeout_ms = 50;

        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"POST /cache/populate HTTP/1.1\r\nHost: x\r\nTarget-Path: /y\r\nContent-Type: a/b\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle_connection(&mut server, &ctx))
            .await
            .expect("handler gives up on a stalled body")
            .unwrap();
        drop(server);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 408 Request Timeout"), "{out}");
        assert!(ctx.cache.get("x/y").await.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn upstream_without_response_head_is_504() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, "");
        ctx.config.request_head_timeout_ms = 50;
        set_test_upstream_connector(|_target: &UpstreamTarget| async {
            let (proxy_side, mut upstream_side) = duplex(4096);
            tokio::spawn(async move {
                let _ = read_message_head(&mut upstream_side, 4096).await;
                // Accepts the request, never answers.
                std::future::pending::<()>().await;
            });
            Ok::<_, anyhow::Error>(UpstreamStream::Mock(proxy_side))
        });

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            exchange(
                &ctx,
                b"GET http://slow.example/ HTTP/1.1\r\nHost: slow.example\r\n\r\n",
            ),
        )
        .await
        .expect("handler gives up on a silent upstream");
        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout"), "{response}");
        assert!(ctx.cache.get("slow.example/").await.is_none());
        reset_test_upstream_connector();
    }

    #[tokio::test]
    async fn unsupported_target_closes_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let response = exchange(&ctx, b"GET ftp://files.example/a HTTP/1.1\r\n\r\n").await;
        assert!(response.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn unreachable_upstream_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "");
        let _seen = fake_upstream(Vec::new());
        let response = exchange(
            &ctx,
            b"GET http://down.example/ HTTP/1.1\r\nHost: down.example\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
        reset_test_upstream_connector();
    }

    #[tokio::test]
    #[serial]
    async fn expired_entry_is_refetched_when_ttl_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, "");
        ctx.config.cache_ttl_secs = Some(60);
        let mut stale = CacheEntry::new(Bytes::from_static(b"old"), "text/plain");
        stale.timestamp = Utc::now() - chrono::Duration::seconds(600);
        ctx.cache.put("ttl.example/", &stale).await;

        let seen = fake_upstream(vec![b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nnew"]);
        let response = exchange(
            &ctx,
            b"GET http://ttl.example/ HTTP/1.1\r\nHost: ttl.example\r\n\r\n",
        )
        .await;
        assert!(response.ends_with("new"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        let refreshed = ctx.cache.get("ttl.example/").await.unwrap();
        assert_eq!(&refreshed.content[..], b"new");
        reset_test_upstream_connector();
    }

    #[tokio::test]
    #[serial]
    async fn connect_acknowledges_then_relays_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context(&dir, ""));

        let (proxy_side, mut upstream_side) = duplex(4096);
        let holder = Arc::new(Mutex::new(Some(proxy_side)));
        let targets = Arc::new(Mutex::new(Vec::new()));
        set_test_upstream_connector({
            let targets = targets.clone();
            move |target: &UpstreamTarget| {
                targets.lock().unwrap().push(target.clone());
                let stream = holder.lock().unwrap().take();
                async move {
                    stream
                        .map(UpstreamStream::Mock)
                        .ok_or_else(|| anyhow!("connector already used"))
                }
            }
        });

        let (mut client, mut server) = duplex(4096);
        let handler = tokio::spawn({
            let ctx = ctx.clone();
            async move { handle_connection(&mut server, &ctx).await }
        });

        client
            .write_all(b"CONNECT secure.example:443 HTTP/1.1\r\nHost: secure.example:443\r\n\r\n")
            .await
            .unwrap();
        let mut ack = vec![0u8; 256];
        let n = client.read(&mut ack).await.unwrap();
        let ack = String::from_utf8_lossy(&ack[..n]);
        assert!(ack.starts_with("HTTP/1.1 200 Connection established\r\n"));
        assert!(ack.ends_with("\r\n\r\n"));

        let opaque = b"\x16\x03\x01GET / HTTP/1.1\r\n\r\n";
        client.write_all(opaque).await.unwrap();
        let mut relayed = vec![0u8; opaque.len()];
        upstream_side.read_exact(&mut relayed).await.unwrap();
        assert_eq!(&relayed[..], &opaque[..]);

        upstream_side.write_all(b"\x17\x03\x03reply").await.unwrap();
        let mut back = [0u8; 8];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"\x17\x03\x03reply");

        drop(client);
        handler.await.unwrap().unwrap();
        assert_eq!(
            targets.lock().unwrap().as_slice(),
            &[UpstreamTarget::new("secure.example", 443)]
        );
        assert!(ctx.cache.get("secure.example/").await.is_none());
        reset_test_upstream_connector();
    }

    #[test]
    fn augment_inserts_before_terminator() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let out = augment_head(head, &[("X-Cache", "MISS")]);
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nX-Cache: MISS\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn upstream_request_drops_hop_by_hop_headers() {
        let request = parse_request(
            b"POST http://api.example:8080/v1 HTTP/1.1\r\nHost: api.example:8080\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive\r\nContent-Length: 2\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();
        let target = UpstreamTarget::new("api.example", 8080);
        let out = build_upstream_request(&request, &target, "/v1", b"{}");
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "POST /v1 HTTP/1.1\r\nHost: api.example:8080\r\nContent-Length: 2\r\nAccept: */*\r\nConnection: close\r\n\r\n{}"
        );
    }
}

//! Upstream connection establishment

use anyhow::{anyhow, Context};
#[cfg(test)]
use once_cell::sync::Lazy;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
#[cfg(test)]
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
#[cfg(test)]
use std::future::Future;
#[cfg(test)]
use tokio::io::DuplexStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Where a request is headed after remapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub enum UpstreamStream {
    Plain(TcpStream),
    #[cfg(test)]
    Mock(DuplexStream),
}

#[cfg(test)]
type TestConnectorFn = dyn Fn(&UpstreamTarget) -> Pin<Box<dyn Future<Output = anyhow::Result<UpstreamStream>> + Send>>
    + Send
    + Sync;

#[cfg(test)]
static TEST_CONNECTOR: Lazy<Mutex<Option<Arc<TestConnectorFn>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
pub(crate) fn set_test_upstream_connector<F, Fut>(connector: F)
where
    F: Fn(&UpstreamTarget) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<UpstreamStream>> + Send + 'static,
{
    let mut guard = TEST_CONNECTOR.lock().unwrap();
    let arc_connector: Arc<TestConnectorFn> = Arc::new(move |target| Box::pin(connector(target)));
    *guard = Some(arc_connector);
}

#[cfg(test)]
pub(crate) fn reset_test_upstream_connector() {
    let mut guard = TEST_CONNECTOR.lock().unwrap();
    guard.take();
}

/// Resolve `target` and open a TCP connection, trying each resolved address
/// in turn until one accepts or `timeout` elapses.
pub async fn connect_upstream(
    target: &UpstreamTarget,
    timeout: Duration,
) -> anyhow::Result<UpstreamStream> {
    #[cfg(test)]
    let connector_opt = {
        let guard = TEST_CONNECTOR.lock().unwrap();
        guard.as_ref().cloned()
    };
    #[cfg(test)]
    if let Some(connector) = connector_opt {
        return connector(target).await;
    }

    let stream = tokio::time::timeout(timeout, connect_any(target))
        .await
        .map_err(|_| anyhow!("timed out after {:?} connecting to {}", timeout, target))??;
    let _ = stream.set_nodelay(true);
    Ok(UpstreamStream::Plain(stream))
}

async fn connect_any(target: &UpstreamTarget) -> anyhow::Result<TcpStream> {
    let addrs = resolve(target)
        .await
        .with_context(|| format!("resolving {}", target.host))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::debug!("Connected to {} via {}", target, addr);
                return Ok(stream);
            }
            Err(err) => {
                tracing::debug!("Connect to {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(err) => Err(err).with_context(|| format!("connecting to upstream {}", target)),
        None => Err(anyhow!("no addresses found for {}", target.host)),
    }
}

async fn resolve(target: &UpstreamTarget) -> io::Result<Vec<SocketAddr>> {
    let bare = target
        .host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&target.host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, target.port)]);
    }
    Ok(tokio::net::lookup_host((bare, target.port)).await?.collect())
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

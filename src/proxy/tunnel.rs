//! Opaque byte relay for CONNECT tunnels

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const RELAY_BUFFER_BYTES: usize = 16 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte counts moved by a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copy bytes in both directions until either side closes or errors, or no
/// write completes in either direction for `idle_timeout`. Each direction is
/// pumped independently, so a peer that stops reading cannot stall the other
/// direction. The stream is never inspected.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U, idle_timeout: Duration) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let last_activity_ms = AtomicU64::new(0);
    let client_to_upstream = AtomicU64::new(0);
    let upstream_to_client = AtomicU64::new(0);

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        result = pump(&mut client_read, &mut upstream_write, &client_to_upstream, &last_activity_ms, started) => {
            match result {
                Ok(()) => tracing::debug!("Tunnel: client closed connection"),
                Err(e) => tracing::debug!("Tunnel: client to upstream failed: {}", e),
            }
        }
        result = pump(&mut upstream_read, &mut client_write, &upstream_to_client, &last_activity_ms, started) => {
            match result {
                Ok(()) => tracing::debug!("Tunnel: upstream closed connection"),
                Err(e) => tracing::debug!("Tunnel: upstream to client failed: {}", e),
            }
        }
        _ = idle_watchdog(idle_timeout, &last_activity_ms, started) => {
            tracing::debug!("Tunnel idle for {:?}, closing", idle_timeout);
        }
    }

    // A peer that stopped reading may never let a shutdown flush.
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, upstream_write.shutdown()).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, client_write.shutdown()).await;

    RelayStats {
        client_to_upstream: client_to_upstream.load(Ordering::Relaxed),
        upstream_to_client: upstream_to_client.load(Ordering::Relaxed),
    }
}

/// One direction of the tunnel. Activity is stamped only once a write lands.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    moved: &AtomicU64,
    last_activity_ms: &AtomicU64,
    started: Instant,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
        last_activity_ms.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

async fn idle_watchdog(idle_timeout: Duration, last_activity_ms: &AtomicU64, started: Instant) {
    loop {
        let last = Duration::from_millis(last_activity_ms.load(Ordering::Relaxed));
        let deadline = started + last + idle_timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

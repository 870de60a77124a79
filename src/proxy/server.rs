//! Listener, accept loop and server lifecycle

use crate::cache::DiskCache;
use crate::config::{cache_root, remap_path, ProxyConfig};
use crate::proxy::handler::{handle_connection, ProxyContext};
use crate::proxy::remap::RemapTable;
use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;
use uuid::Uuid;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to prepare proxy: {0:#}")]
    Config(anyhow::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener was not ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("accept loop exited before it was ready")]
    AcceptLoopExited,
}

#[derive(Debug, Default)]
struct ServerState {
    running: AtomicBool,
    listening: AtomicBool,
    active_connections: AtomicUsize,
    /// Handler tasks still held by the accept loop, finished or not.
    tracked_handlers: AtomicUsize,
}

/// Decrements the active connection count when a handler finishes, however it finishes.
struct ConnectionGuard(Arc<ServerState>);

impl ConnectionGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running proxy instance. Dropping it without calling [`ProxyServer::stop`]
/// also shuts the accept loop down, but does not wait for it.
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ProxyServer {
    /// Load configuration, remap rules and the cache from `config_dir`, then start.
    pub async fn start_from_dir(config_dir: &Path) -> Result<Self, StartError> {
        let config = ProxyConfig::load(config_dir).map_err(StartError::Config)?;
        let remap = RemapTable::load(&remap_path(config_dir)).map_err(StartError::Config)?;

        let cache_dir = cache_root(config_dir);
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("creating cache directory {}", cache_dir.display()))
            .map_err(StartError::Config)?;
        let cache = DiskCache::new(cache_dir, config.max_cached_body_bytes);

        tracing::info!(
            "Loaded {} remap rule(s); cache at {}",
            remap.rules().len(),
            cache.root().display()
        );

        Self::start(ProxyContext {
            config,
            remap,
            cache,
        })
        .await
    }

    /// Bind the listener and wait until the accept loop reports it is serving.
    pub async fn start(context: ProxyContext) -> Result<Self, StartError> {
        let ready_timeout = context.config.ready_timeout();
        let listener = bind_listener(&context.config).await?;
        let local_addr = listener.local_addr().map_err(|source| StartError::Bind {
            addr: context.config.listen_addr(),
            source,
        })?;

        let context = Arc::new(context);
        let state = Arc::new(ServerState::default());
        state.running.store(true, Ordering::SeqCst);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            context.clone(),
            state.clone(),
            shutdown_rx,
            ready_tx,
        ));

        let server = Self {
            context,
            local_addr,
            state,
            shutdown,
            accept_task,
        };

        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(())) => {
                tracing::info!("Proxy server listening on {}", local_addr);
                Ok(server)
            }
            Ok(Err(_)) => {
                server.stop().await;
                Err(StartError::AcceptLoopExited)
            }
            Err(_) => {
                server.stop().await;
                Err(StartError::ReadyTimeout(ready_timeout))
            }
        }
    }

    /// Stop accepting, give in-flight connections the configured grace period,
    /// then abort whatever is left.
    pub async fn stop(self) {
        tracing::info!("Stopping proxy on {}", self.local_addr);
        self.state.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Err(err) = self.accept_task.await {
            tracing::error!("Accept loop ended abnormally: {}", err);
        }
        self.state.listening.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst) && self.state.listening.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.context.config
    }
}

async fn bind_listener(config: &ProxyConfig) -> Result<TcpListener, StartError> {
    let addr = config.listen_addr();
    let bind_err = |source: std::io::Error| StartError::Bind {
        addr: addr.clone(),
        source,
    };

    let socket_addr = tokio::net::lookup_host(addr.as_str())
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })?;

    let socket = if socket_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(socket_addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ProxyContext>,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) {
    let permits = Arc::new(Semaphore::new(context.config.max_connections));
    let mut connections = JoinSet::new();

    state.listening.store(true, Ordering::SeqCst);
    let _ = ready.send(());

    'accept: loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_finished(joined);
                state.tracked_handlers.store(connections.len(), Ordering::SeqCst);
                continue;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // Finished handlers keep being reaped while waiting for the next client.
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break 'accept,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_finished(joined);
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let guard = ConnectionGuard::new(state.clone());
                        let context = context.clone();
                        let span = tracing::info_span!("conn", id = %Uuid::new_v4(), %peer);
                        connections.spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                serve_connection(socket, &context).await;
                            }
                            .instrument(span),
                        );
                        state.tracked_handlers.store(connections.len(), Ordering::SeqCst);
                        break;
                    }
                    Err(err) => {
                        tracing::error!("Accept error: {}", err);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
            state.tracked_handlers.store(connections.len(), Ordering::SeqCst);
        }
    }

    state.listening.store(false, Ordering::SeqCst);
    drop(listener);

    if !connections.is_empty() {
        let grace = context.config.shutdown_grace();
        tracing::info!(
            "Waiting up to {:?} for {} connection(s) to finish",
            grace,
            connections.len()
        );
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Aborting {} connection(s) after grace period", connections.len());
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
    }

    state.tracked_handlers.store(0, Ordering::SeqCst);
    state.running.store(false, Ordering::SeqCst);
    tracing::info!("Proxy server stopped");
}

fn log_finished(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!("Connection handler panicked: {}", err);
        }
    }
}

async fn serve_connection(mut socket: TcpStream, context: &ProxyContext) {
    tracing::debug!("Accepted connection");
    let _ = socket.set_nodelay(true);

    if let Err(e) = handle_connection(&mut socket, context).await {
        // Client hang-ups are routine; anything else is worth an error line.
        let err_str = format!("{e:#}").to_lowercase();
        if err_str.contains("eof")
            || err_str.contains("broken pipe")
            || err_str.contains("connection reset")
            || err_str.contains("connection closed")
        {
            tracing::debug!("Connection closed by client: {:#}", e);
        } else {
            tracing::error!("Error handling connection: {:#}", e);
        }
    }
    let _ = socket.shutdown().await;
}

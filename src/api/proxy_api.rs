//! Proxy control API
//!
//! At most one proxy runs per process. Start and stop calls are serialized;
//! status queries never wait on them.

use once_cell::sync::Lazy;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use crate::proxy::{ProxyServer, StartError};

// Global proxy state
static SERVER: Mutex<Option<ProxyServer>> = Mutex::new(None);
static CONTROL: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

/// Last started proxy address (port, bind_address)
static CURRENT_PROXY_CONFIG: Lazy<RwLock<(u16, String)>> =
    Lazy::new(|| RwLock::new((crate::config::DEFAULT_PORT, "0.0.0.0".to_string())));

fn server_slot() -> MutexGuard<'static, Option<ProxyServer>> {
    SERVER.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Get the version of the edgeproxy library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
/// In release builds `log_dir` receives daily-rotated log files; otherwise logs go to stderr.
#[allow(unused_variables)]
pub fn init_core(log_dir: Option<String>) -> Result<bool, String> {
    let level = resolve_log_level();

    #[cfg(not(debug_assertions))]
    {
        if let Some(dir) = log_dir.as_ref() {
            let log_dir = std::path::PathBuf::from(dir);
            std::fs::create_dir_all(&log_dir).map_err(|e| {
                format!(
                    "Failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                )
            })?;
            let file_appender = tracing_appender::rolling::daily(&log_dir, "edgeproxy");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Logging lasts until process exit.
            std::mem::forget(guard);

            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(non_blocking)
                .try_init();
            tracing::info!("edgeproxy core initialized v{}", env!("CARGO_PKG_VERSION"));
            return Ok(true);
        }
    }

    // A subscriber installed earlier by the host wins.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
    tracing::info!("edgeproxy core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(true)
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}

/// Outcome of [`start_proxy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyRunning,
    Failed(String),
    TimedOut,
}

impl StartStatus {
    /// Numeric form for FFI hosts: 0 started, 1 already running, -1 failed, -2 timed out.
    pub fn code(&self) -> i32 {
        match self {
            StartStatus::Started => 0,
            StartStatus::AlreadyRunning => 1,
            StartStatus::Failed(_) => -1,
            StartStatus::TimedOut => -2,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, StartStatus::Started | StartStatus::AlreadyRunning)
    }
}

/// Proxy status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    pub is_running: bool,
    /// Address of the most recently started proxy; kept after it stops
    pub bind_address: String,
    /// Port of the most recently started proxy; kept after it stops
    pub port: u16,
    pub active_connections: usize,
}

/// Start the proxy using `config_dir` for `proxy.json`, `remap.config` and `cache/`.
pub async fn start_proxy(config_dir: impl AsRef<Path>) -> StartStatus {
    let _control = CONTROL.lock().await;

    let stale = {
        let mut slot = server_slot();
        match slot.as_ref() {
            Some(server) if server.is_running() => {
                tracing::info!("Proxy already running on {}", server.local_addr());
                return StartStatus::AlreadyRunning;
            }
            _ => slot.take(),
        }
    };
    if let Some(server) = stale {
        server.stop().await;
    }

    let config_dir = config_dir.as_ref();
    tracing::info!("Starting proxy with config dir {}", config_dir.display());
    match ProxyServer::start_from_dir(config_dir).await {
        Ok(server) => {
            {
                let mut current = CURRENT_PROXY_CONFIG
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                *current = (server.local_addr().port(), server.config().bind_address.clone());
            }
            *server_slot() = Some(server);
            StartStatus::Started
        }
        Err(StartError::ReadyTimeout(waited)) => {
            tracing::error!("Proxy did not become ready within {:?}", waited);
            StartStatus::TimedOut
        }
        Err(err) => {
            tracing::error!("Failed to start proxy: {}", err);
            StartStatus::Failed(err.to_string())
        }
    }
}

/// Stop the proxy. A no-op when nothing is running.
pub async fn stop_proxy() {
    let _control = CONTROL.lock().await;
    let server = server_slot().take();
    match server {
        Some(server) => server.stop().await,
        None => tracing::debug!("Stop requested but proxy is not running"),
    }
}

/// True once the listener is accepting, until stop begins.
pub fn is_proxy_running() -> bool {
    server_slot().as_ref().is_some_and(ProxyServer::is_running)
}

/// Get current proxy status.
/// Before the first start, address and port are the configuration defaults.
pub fn get_proxy_status() -> ProxyStatus {
    let (port, bind_address) = {
        let config = CURRENT_PROXY_CONFIG
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (config.0, config.1.clone())
    };
    let slot = server_slot();
    ProxyStatus {
        is_running: slot.as_ref().is_some_and(ProxyServer::is_running),
        bind_address,
        port,
        active_connections: slot.as_ref().map_or(0, ProxyServer::active_connections),
    }
}

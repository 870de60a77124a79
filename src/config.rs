//! Runtime configuration
//!
//! Everything has a default; `proxy.json` in the config directory may
//! override any subset of fields.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "proxy.json";
pub const REMAP_FILE_NAME: &str = "remap.config";
pub const CACHE_DIR_NAME: &str = "cache";

pub const DEFAULT_PORT: u16 = 8888;

/// Proxy server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address
    pub bind_address: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Largest accepted request or response header block
    pub max_header_bytes: usize,
    /// Largest accepted request body
    pub max_request_body_bytes: usize,
    /// Largest response body that is captured for caching
    pub max_cached_body_bytes: usize,
    /// Concurrent connection limit
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    /// Deadline for a request head, request body or upstream response head to arrive
    pub request_head_timeout_ms: u64,
    /// Tunnels with no traffic in either direction for this long are closed
    pub tunnel_idle_timeout_secs: u64,
    /// How long `start` waits for the listener to come up
    pub ready_timeout_ms: u64,
    /// How long `stop` waits for in-flight connections
    pub shutdown_grace_ms: u64,
    /// Maximum age of a servable cache hit; unset means hits never expire
    pub cache_ttl_secs: Option<u64>,
    /// Add `X-Cache`/`X-Cache-Age`/`Via` to responses
    pub cache_headers: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_header_bytes: 64 * 1024,
            max_request_body_bytes: 32 * 1024 * 1024,
            max_cached_body_bytes: 32 * 1024 * 1024,
            max_connections: 256,
            connect_timeout_ms: 10_000,
            request_head_timeout_ms: 30_000,
            tunnel_idle_timeout_secs: 300,
            ready_timeout_ms: 5_000,
            shutdown_grace_ms: 2_000,
            cache_ttl_secs: None,
            cache_headers: true,
        }
    }
}

impl ProxyConfig {
    /// Load `proxy.json` from `config_dir`, falling back to defaults when absent.
    pub fn load(config_dir: &Path) -> anyhow::Result<Self> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if self.request_head_timeout_ms == 0 {
            anyhow::bail!("request_head_timeout_ms must be greater than zero");
        }
        if self.max_header_bytes < 1024 {
            anyhow::bail!("max_header_bytes must be at least 1024");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_head_timeout(&self) -> Duration {
        Duration::from_millis(self.request_head_timeout_ms)
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

pub fn remap_path(config_dir: &Path) -> PathBuf {
    config_dir.join(REMAP_FILE_NAME)
}

pub fn cache_root(config_dir: &Path) -> PathBuf {
    config_dir.join(CACHE_DIR_NAME)
}

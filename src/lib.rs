//! # edgeproxy
//!
//! Caching forward proxy for plain HTTP with CONNECT tunnelling.
//!
//! ## Features
//!
//! - Absolute-form and origin-form HTTP forwarding with a per-key disk cache
//! - `remap.config` host/path rewrite rules
//! - Opaque CONNECT tunnels
//! - `POST /cache/populate` to seed the cache out of band
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            api::proxy_api (start / stop / status)         │
//! ├─────────────────────────────────────────────────────────┤
//! │                   proxy::ProxyServer                      │
//! │  ┌──────────┐  ┌─────────┐  ┌────────┐  ┌────────────┐   │
//! │  │ Acceptor │──│ Handler │──│ Parser │  │ Disk Cache │   │
//! │  └──────────┘  └─────────┘  └────────┘  └────────────┘   │
//! │                  │     │                                  │
//! │             ┌────────┐ ┌────────┐                         │
//! │             │ Remap  │ │ Tunnel │                         │
//! │             └────────┘ └────────┘                         │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod proxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

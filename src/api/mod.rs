//! edgeproxy control surface
//!
//! Process-wide start/stop/status functions wrapping a single
//! [`crate::proxy::ProxyServer`], for embedding hosts and the CLI.

pub mod proxy_api;

//! Forward proxy: request parsing, remapping, upstream forwarding, CONNECT
//! tunnels and the listener that ties them together.

pub mod handler;
pub mod parser;
pub mod remap;
pub mod server;
pub mod tunnel;
pub mod upstream;

pub use handler::ProxyContext;
pub use remap::{RemapRule, RemapTable, RemapTarget};
pub use server::{ProxyServer, StartError};

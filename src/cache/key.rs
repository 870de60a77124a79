//! Cache keys and their file names.

use sha2::{Digest, Sha256};

/// Build the cache key for a request target: host followed by path.
///
/// Scheme, port and query normalization are deliberately absent, so
/// `host:8080/a` and `host/a` share an entry.
pub fn cache_key(host: &str, path: &str) -> String {
    let mut key = String::with_capacity(host.len() + path.len());
    key.push_str(host);
    key.push_str(path);
    key
}

/// Stable file name for a key (lowercase hex SHA-256).
pub fn key_file_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

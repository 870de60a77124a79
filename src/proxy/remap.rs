//! Host/path rewrite rules loaded from `remap.config`
//!
//! Each rule line reads `map <fromURL> <toURL>`. Rules are tried in file
//! order and the first match wins. A `from` path of `/` matches any path on
//! that host.

use crate::proxy::parser::split_host_and_port;
use anyhow::Context;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapRule {
    pub from_host: String,
    pub from_port: Option<u16>,
    pub from_path: String,
    pub to_host: String,
    pub to_port: Option<u16>,
    pub to_path: String,
}

impl RemapRule {
    fn matches(&self, host: &str, port: u16, path: &str) -> bool {
        self.from_host == host
            && self.from_port.map_or(true, |p| p == port)
            && (self.from_path == path || self.from_path == "/")
    }
}

/// Destination after remapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Default)]
pub struct RemapTable {
    rules: Vec<RemapRule>,
}

impl RemapTable {
    pub fn new(rules: Vec<RemapRule>) -> Self {
        Self { rules }
    }

    /// Load rules from `path`. A missing file yields an empty table.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No remap rules at {}", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let mut rules = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') || line.starts_with(char::is_whitespace) {
                continue;
            }
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some("map"), Some(from), Some(to)) => {
                    let (from_host, from_port, from_path) = split_rule_url(from);
                    let (to_host, to_port, to_path) = split_rule_url(to);
                    let rule = RemapRule {
                        from_host,
                        from_port,
                        from_path,
                        to_host,
                        to_port,
                        to_path,
                    };
                    tracing::info!(
                        "Added remap rule: {}{} -> {}{}",
                        rule.from_host,
                        rule.from_path,
                        rule.to_host,
                        rule.to_path
                    );
                    rules.push(rule);
                }
                _ => tracing::warn!("Skipping remap.config line {}: {:?}", idx + 1, line),
            }
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[RemapRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite a destination with the first matching rule, if any.
    pub fn remap(&self, host: &str, port: u16, path: &str) -> Option<RemapTarget> {
        let rule = self.rules.iter().find(|r| r.matches(host, port, path))?;
        tracing::info!(
            "Remapping request: {}{} -> {}{}",
            host,
            path,
            rule.to_host,
            rule.to_path
        );
        Some(RemapTarget {
            host: rule.to_host.clone(),
            port: rule.to_port.unwrap_or(port),
            path: rule.to_path.clone(),
        })
    }
}

fn split_rule_url(url: &str) -> (String, Option<u16>, String) {
    let rest = url.split_once("//").map(|(_, rest)| rest).unwrap_or(url);
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = split_host_and_port(authority);
    (host, port, path)
}

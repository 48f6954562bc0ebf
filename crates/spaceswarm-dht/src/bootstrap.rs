//! Bootstrap node parsing and resolution.
//!
//! Entries are `host:port` or `suggestedIP@host:port`. The suggested IP is
//! used when the host does not resolve.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Public bootstrap nodes
pub const BOOTSTRAP_NODES: &[&str] = &[
    "159.69.192.75@space.bsv.direct:49737",
    "159.69.192.75@space.bsv.direct:8339",
];

/// Static nodes added as seeds on start
pub const KNOWN_NODES: &[SocketAddr] = &[];

/// Malformed bootstrap entry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bootstrap node: {0}")]
pub struct BootstrapParseError(pub String);

/// One bootstrap entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapNode {
    /// Fallback address when `host` does not resolve
    pub suggested_ip: Option<IpAddr>,
    /// Host name or literal address
    pub host: String,
    /// Port
    pub port: u16,
}

impl FromStr for BootstrapNode {
    type Err = BootstrapParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || BootstrapParseError(s.to_string());
        let (suggested_ip, rest) = match s.split_once('@') {
            Some((ip, rest)) => (Some(ip.parse::<IpAddr>().map_err(|_| err())?), rest),
            None => (None, s),
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(err)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(err());
        }
        let port = port.parse::<u16>().map_err(|_| err())?;
        Ok(Self {
            suggested_ip,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BootstrapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = self.suggested_ip {
            write!(f, "{ip}@")?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl BootstrapNode {
    /// Resolve to a socket address, falling back to the suggested IP.
    pub async fn resolve(&self) -> Option<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, self.port));
        }
        match tokio::net::lookup_host((self.host.as_str(), self.port)).await {
            Ok(mut addrs) => {
                let resolved = addrs.find(SocketAddr::is_ipv4);
                resolved.or_else(|| self.fallback())
            }
            Err(e) => {
                tracing::debug!("could not resolve {}: {}", self.host, e);
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> Option<SocketAddr> {
        self.suggested_ip.map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// Parse and resolve every entry, skipping the ones that fail.
pub async fn resolve_all(entries: &[String]) -> Vec<SocketAddr> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.parse::<BootstrapNode>() {
            Ok(node) => {
                if let Some(addr) = node.resolve().await {
                    if !out.contains(&addr) {
                        out.push(addr);
                    }
                }
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }
    out
}

/// Default bootstrap list as owned strings
#[must_use]
pub fn default_bootstrap() -> Vec<String> {
    BOOTSTRAP_NODES.iter().map(|s| (*s).to_string()).collect()
}

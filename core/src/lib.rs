//! Core utilities and shared types for the cluster bootstrap engine.

pub mod config;
pub mod executor;
pub mod retry;

pub use config::{CaExchangeConfig, CertConfig, ClusterConfig, ConfigError};
pub use executor::{DatabaseExecutor, ExecError, SqlValue};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Address of a cluster peer as written in `cluster_nodes` (`host` or `host:port`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: Option<u16>,
}

impl PeerAddr {
    /// Host to dial together with an explicit service port, ignoring the
    /// configured (SQL) port.
    pub fn with_port(&self, port: u16) -> (String, u16) {
        (self.host.clone(), port)
    }
}

impl From<&str> for PeerAddr {
    fn from(s: &str) -> Self {
        let s = s.trim();
        // [v6]:port or [v6]
        if let Some(rest) = s.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
                return PeerAddr { host: host.to_string(), port };
            }
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(p) => PeerAddr { host: host.to_string(), port: Some(p) },
                Err(_) => PeerAddr { host: s.to_string(), port: None },
            },
            _ => PeerAddr { host: s.to_string(), port: None },
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host = if self.host.contains(':') { format!("[{}]", self.host) } else { self.host.clone() };
        match self.port {
            Some(p) => write!(f, "{}:{}", host, p),
            None => write!(f, "{}", host),
        }
    }
}

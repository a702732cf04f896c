use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::PeerAddr;

pub const DEFAULT_CONFIG_FILE: &str = "clusterkit.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
}

/// Settings for the CA exchange endpoint and for joiners fetching from it.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CaExchangeConfig {
    pub port: u16,
    pub bind_addr: String,
    pub window_secs: u64,
    pub max_fetches: u32,
    pub fetch_timeout_ms: u64,
    pub fetch_attempts: u32,
    pub retry_delay_ms: u64,
    /// Hex SHA-256 of the cluster CA certificate (DER). When set, any CA
    /// fetched or found locally must match it.
    pub expected_fingerprint: Option<String>,
}

impl Default for CaExchangeConfig {
    fn default() -> Self {
        CaExchangeConfig {
            port: 8443,
            bind_addr: "0.0.0.0".into(),
            window_secs: 600,
            max_fetches: 16,
            fetch_timeout_ms: 3000,
            fetch_attempts: 5,
            retry_delay_ms: 500,
            expected_fingerprint: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CertConfig {
    pub ca_common_name: String,
    pub ca_validity_days: u32,
    pub node_validity_days: u32,
    /// SQL user that receives a client certificate during bootstrap.
    pub client_user: Option<String>,
    /// Additional hostnames or IPs to embed in the node certificate.
    pub extra_sans: Vec<String>,
}

impl Default for CertConfig {
    fn default() -> Self {
        CertConfig {
            ca_common_name: "Cockroach CA".into(),
            ca_validity_days: 3650,
            node_validity_days: 1825,
            client_user: Some("root".into()),
            extra_sans: Vec::new(),
        }
    }
}

/// Cluster configuration. Built once at startup and handed to each component.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Existing cluster members. Empty means this node starts a new cluster.
    pub cluster_nodes: Vec<String>,
    /// Explicit intent to originate the cluster's trust root even with peers configured.
    pub initialize: bool,
    pub certs_dir: PathBuf,
    pub migrations_dir: PathBuf,
    pub database_name: String,
    pub admin_user: String,
    pub domain: String,
    pub advertise_host: Option<String>,
    pub sql_port: u16,
    pub cockroach_binary: String,
    pub ca_exchange: CaExchangeConfig,
    pub certs: CertConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            cluster_nodes: Vec::new(),
            initialize: false,
            certs_dir: PathBuf::from("certs"),
            migrations_dir: PathBuf::from("migrations"),
            database_name: "defaultdb".into(),
            admin_user: "admin".into(),
            domain: "cluster.local".into(),
            advertise_host: None,
            sql_port: 26257,
            cockroach_binary: "cockroach".into(),
            ca_exchange: CaExchangeConfig::default(),
            certs: CertConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn peers(&self) -> Vec<PeerAddr> {
        self.cluster_nodes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(PeerAddr::from)
            .collect()
    }

    /// A node with no peers, or one told to initialize, originates the CA.
    pub fn is_originator(&self) -> bool {
        self.initialize || self.peers().is_empty()
    }

    /// Subject alternative names for this node's certificate.
    pub fn node_identity(&self) -> Vec<String> {
        let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        if let Some(h) = &self.advertise_host { sans.push(h.clone()); }
        sans.push(self.domain.clone());
        sans.extend(self.certs.extra_sans.iter().cloned());
        let mut seen = std::collections::HashSet::new();
        sans.retain(|s| !s.is_empty() && seen.insert(s.clone()));
        sans
    }
}

/// Load configuration from `path`, or from `./clusterkit.yaml` when present.
/// Falls back to defaults when no file is found.
pub fn load_config(path: Option<&Path>) -> Result<ClusterConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else {
                tracing::debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                return Ok(ClusterConfig::default());
            }
        }
    };
    let s = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    let cfg = serde_yaml::from_str(&s).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

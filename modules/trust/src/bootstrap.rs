use clusterkit_core::{ClusterConfig, PeerAddr};
use serde::Serialize;
use std::fmt;

use crate::error::TrustError;
use crate::exchange::{fetch_ca, FetchPolicy};
use crate::issuer::{
    key_matches, verify_issued, CaCertificate, CertIssuer, CertificateAuthority, ClientCertificate, NodeCertificate, NodeIdentity,
};
use crate::store::{CertFile, CertStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates the cluster CA.
    Originator,
    /// Obtains the CA from a peer; never creates one.
    Joiner,
}

/// Progress of a node's trust setup. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Uninitialized,
    CaPresent,
    CertIssued,
    Ready,
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustState::Uninitialized => "uninitialized",
            TrustState::CaPresent => "ca_present",
            TrustState::CertIssued => "cert_issued",
            TrustState::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub role: Role,
    pub peers: Vec<PeerAddr>,
    pub fetch: FetchPolicy,
    /// Pinned CA fingerprint (hex SHA-256); any other CA is a conflict.
    pub expected_fingerprint: Option<String>,
    pub ca_common_name: String,
    pub identity: NodeIdentity,
    pub client_user: Option<String>,
}

impl BootstrapSettings {
    pub fn from_config(cfg: &ClusterConfig) -> Self {
        BootstrapSettings {
            role: if cfg.is_originator() { Role::Originator } else { Role::Joiner },
            peers: cfg.peers(),
            fetch: FetchPolicy::from(&cfg.ca_exchange),
            expected_fingerprint: cfg.ca_exchange.expected_fingerprint.clone(),
            ca_common_name: cfg.certs.ca_common_name.clone(),
            identity: NodeIdentity::node(cfg.node_identity()),
            client_user: cfg.certs.client_user.clone(),
        }
    }
}

/// Drives one node from an empty certificate directory to a usable node
/// certificate. Safe to rerun: whatever is already on disk is kept.
pub struct TrustBootstrapper<S> {
    store: S,
    settings: BootstrapSettings,
    issuer: CertIssuer,
    state: TrustState,
}

impl<S: CertStore> TrustBootstrapper<S> {
    pub fn new(store: S, settings: BootstrapSettings, issuer: CertIssuer) -> Result<Self, TrustError> {
        let state = observe_state(&store)?;
        tracing::debug!(%state, role = ?settings.role, "observed trust state");
        Ok(TrustBootstrapper { store, settings, issuer, state })
    }

    pub fn role(&self) -> Role { self.settings.role }

    pub fn state(&self) -> TrustState { self.state }

    pub fn store(&self) -> &S { &self.store }

    pub fn local_ca(&self) -> Result<Option<CaCertificate>, TrustError> {
        match self.store.read(&CertFile::CaCert)? {
            Some(bytes) => CaCertificate::from_pem(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn check_pinned(&self, ca: &CaCertificate) -> Result<(), TrustError> {
        match &self.settings.expected_fingerprint {
            Some(expected) if !expected.trim().eq_ignore_ascii_case(&ca.fingerprint()) => Err(TrustError::TrustConflict(
                format!("CA fingerprint {} does not match pinned {}", ca.fingerprint(), expected.trim()),
            )),
            _ => Ok(()),
        }
    }

    /// Ensure a CA certificate is present locally. An existing one is kept;
    /// otherwise the originator creates one and a joiner fetches one.
    pub async fn acquire_ca(&mut self) -> Result<CaCertificate, TrustError> {
        if let Some(ca) = self.local_ca()? {
            self.check_pinned(&ca)?;
            tracing::debug!(fingerprint = %ca.fingerprint(), "using existing CA");
            self.advance(TrustState::CaPresent);
            return Ok(ca);
        }
        let ca = match self.settings.role {
            Role::Originator => {
                let authority = self.issuer.synthesize_ca(&self.settings.ca_common_name)?;
                self.check_pinned(authority.certificate())?;
                authority.persist(&self.store)?;
                authority.certificate().clone()
            }
            Role::Joiner => {
                tracing::info!(peers = self.settings.peers.len(), "fetching cluster CA from peers");
                let ca = fetch_ca(&self.settings.peers, &self.settings.fetch).await?;
                self.check_pinned(&ca)?;
                self.store.write(&CertFile::CaCert, ca.pem())?;
                ca
            }
        };
        self.advance(TrustState::CaPresent);
        Ok(ca)
    }

    fn authority(&self) -> Result<CertificateAuthority, TrustError> {
        let cert = self
            .store
            .read(&CertFile::CaCert)?
            .ok_or_else(|| TrustError::MissingCa { path: self.store.location(&CertFile::CaCert) })?;
        let key = self
            .store
            .read(&CertFile::CaKey)?
            .ok_or_else(|| TrustError::MissingCaKey { path: self.store.location(&CertFile::CaKey) })?;
        CertificateAuthority::from_parts(CaCertificate::from_pem(&cert)?, &key)
    }

    /// Sign and persist this node's certificate, plus the configured client
    /// certificate. Requires the CA private key to be present.
    pub fn issue_node_cert(&mut self) -> Result<NodeCertificate, TrustError> {
        if self.state < TrustState::CaPresent {
            return Err(TrustError::InvalidState { action: "issue a node certificate", state: self.state.to_string() });
        }
        let ca = self.authority()?;
        self.check_pinned(ca.certificate())?;
        let node = self.issuer.issue(&self.store, &self.settings.identity, &ca)?;
        if let Some(user) = &self.settings.client_user {
            self.issuer.issue_client(&self.store, user, &ca)?;
        }
        self.advance(TrustState::CertIssued);
        Ok(node)
    }

    /// Client certificate for an additional SQL user.
    pub fn issue_client_cert(&self, user: &str) -> Result<ClientCertificate, TrustError> {
        let ca = self.authority()?;
        self.check_pinned(ca.certificate())?;
        self.issuer.issue_client(&self.store, user, &ca)
    }

    /// Run every remaining step. A node that already holds a valid node
    /// certificate only has its CA checked against the pin.
    pub async fn bootstrap(&mut self) -> Result<TrustState, TrustError> {
        tracing::info!(role = ?self.settings.role, state = %self.state, "trust bootstrap");
        let ca = self.acquire_ca().await?;
        if self.state < TrustState::CertIssued {
            self.issue_node_cert()?;
        }
        tracing::info!(state = %self.state, fingerprint = %ca.fingerprint(), "trust bootstrap complete");
        Ok(self.state)
    }

    pub fn mark_ready(&mut self) -> Result<(), TrustError> {
        if self.state < TrustState::CertIssued {
            return Err(TrustError::InvalidState { action: "mark ready", state: self.state.to_string() });
        }
        self.state = TrustState::Ready;
        Ok(())
    }

    /// Compare a peer's served CA with ours. Returns the shared fingerprint.
    pub async fn check_peer(&self, peer: &PeerAddr) -> Result<String, TrustError> {
        let local = self
            .local_ca()?
            .ok_or_else(|| TrustError::MissingCa { path: self.store.location(&CertFile::CaCert) })?;
        let policy = FetchPolicy { attempts: 1, ..self.settings.fetch };
        let remote = fetch_ca(std::slice::from_ref(peer), &policy).await?;
        if remote.fingerprint() != local.fingerprint() {
            return Err(TrustError::TrustConflict(format!(
                "peer {} serves CA {} but this node trusts {}",
                peer.host,
                remote.fingerprint(),
                local.fingerprint()
            )));
        }
        Ok(local.fingerprint())
    }

    fn advance(&mut self, to: TrustState) {
        if to > self.state {
            self.state = to;
        }
    }
}

/// Derive the state from what is on disk. A node certificate only counts
/// when it verifies against the local CA and `node.key` is its key.
pub fn observe_state<S: CertStore>(store: &S) -> Result<TrustState, TrustError> {
    let ca = match store.read(&CertFile::CaCert)? {
        Some(bytes) => match CaCertificate::from_pem(&bytes) {
            Ok(ca) => ca,
            Err(e) => {
                return Err(TrustError::TrustConflict(format!(
                    "{} is not a usable CA certificate: {e}",
                    store.location(&CertFile::CaCert).display()
                )))
            }
        },
        None => return Ok(TrustState::Uninitialized),
    };
    let (cert, key) = match (store.read(&CertFile::NodeCert)?, store.read(&CertFile::NodeKey)?) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return Ok(TrustState::CaPresent),
    };
    let complete = verify_issued(&cert, &ca).unwrap_or(false) && key_matches(&cert, &key).unwrap_or(false);
    if !complete {
        tracing::debug!(path = %store.location(&CertFile::NodeCert).display(), "node certificate unusable, will reissue");
        return Ok(TrustState::CaPresent);
    }
    Ok(TrustState::CertIssued)
}

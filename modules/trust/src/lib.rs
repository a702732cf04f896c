//! Cluster trust bootstrap: one CA per cluster, one certificate per node.
//!
//! The first node (the originator) creates the CA. Every other node (a
//! joiner) fetches the CA certificate from a peer's short-lived exchange
//! endpoint. The CA private key never crosses that endpoint.

mod bootstrap;
mod error;
mod exchange;
mod issuer;
mod store;

pub use bootstrap::{observe_state, BootstrapSettings, Role, TrustBootstrapper, TrustState};
pub use error::TrustError;
pub use exchange::{fetch_ca, fetch_from, CaExchangeServer, ExchangeLimits, FetchPolicy, ServeSummary, ShutdownReason};
pub use issuer::{key_matches, verify_issued, CaCertificate, CertIssuer, CertificateAuthority, ClientCertificate, NodeCertificate, NodeIdentity};
pub use store::{CertFile, CertStore, FsCertStore};

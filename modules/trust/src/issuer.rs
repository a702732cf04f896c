use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use std::fmt;
use ::time::{Duration, OffsetDateTime};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use crate::error::TrustError;
use crate::store::{CertFile, CertStore};

/// Common name CockroachDB requires on node certificates.
pub const NODE_COMMON_NAME: &str = "node";

/// Backdating applied to `not_before` to tolerate clock skew between nodes.
const CLOCK_SKEW: Duration = Duration::hours(1);

/// Public half of the cluster CA: exactly the bytes found on disk or on the
/// wire, checked to hold a CA certificate and nothing secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCertificate {
    pem: Vec<u8>,
    der: Vec<u8>,
}

impl CaCertificate {
    pub fn from_pem(bytes: &[u8]) -> Result<Self, TrustError> {
        if bytes.windows(b"PRIVATE KEY".len()).any(|w| w == b"PRIVATE KEY") {
            return Err(TrustError::Certificate("refusing CA bytes that contain a private key".into()));
        }
        let (_, pem) = parse_x509_pem(bytes).map_err(|e| TrustError::Certificate(format!("not a PEM certificate: {e}")))?;
        if pem.label != "CERTIFICATE" {
            return Err(TrustError::Certificate(format!("unexpected PEM block {:?}", pem.label)));
        }
        let is_ca = pem
            .parse_x509()
            .map(|x509| x509.is_ca())
            .map_err(|e| TrustError::Certificate(format!("invalid certificate: {e}")))?;
        if !is_ca {
            return Err(TrustError::Certificate("certificate is not a CA".into()));
        }
        Ok(CaCertificate { pem: bytes.to_vec(), der: pem.contents })
    }

    pub fn pem(&self) -> &[u8] { &self.pem }

    /// Lowercase hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    pub fn subject(&self) -> String {
        X509Certificate::from_der(&self.der).map(|(_, c)| c.subject().to_string()).unwrap_or_default()
    }

    pub fn not_after(&self) -> Option<OffsetDateTime> {
        X509Certificate::from_der(&self.der).ok().map(|(_, c)| c.validity().not_after.to_datetime())
    }

    fn with_x509<T>(&self, f: impl FnOnce(&X509Certificate<'_>) -> T) -> Result<T, TrustError> {
        let (_, x509) =
            X509Certificate::from_der(&self.der).map_err(|e| TrustError::Certificate(format!("invalid CA: {e}")))?;
        Ok(f(&x509))
    }
}

/// CA certificate together with its private key. Only the originator
/// creates one; joiners assemble it from a fetched certificate and a key
/// copied out of band.
pub struct CertificateAuthority {
    cert: CaCertificate,
    key_pem: String,
    created_at: OffsetDateTime,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("fingerprint", &self.cert.fingerprint())
            .field("created_at", &self.created_at)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl CertificateAuthority {
    /// Pair a certificate with a private key, refusing a key that does not
    /// belong to the certificate.
    pub fn from_parts(cert: CaCertificate, key_pem: &[u8]) -> Result<Self, TrustError> {
        let key_pem = String::from_utf8(key_pem.to_vec())
            .map_err(|_| TrustError::Certificate("CA key is not valid PEM text".into()))?;
        let key = KeyPair::from_pem(&key_pem)?;
        let (matches, not_before) = cert.with_x509(|x509| {
            (&*x509.public_key().subject_public_key.data == key.public_key_raw(), x509.validity().not_before.to_datetime())
        })?;
        if !matches {
            return Err(TrustError::TrustConflict(format!(
                "CA key does not match CA certificate {}",
                cert.fingerprint()
            )));
        }
        Ok(CertificateAuthority { cert, key_pem, created_at: not_before + CLOCK_SKEW })
    }

    pub fn certificate(&self) -> &CaCertificate { &self.cert }

    pub fn created_at(&self) -> OffsetDateTime { self.created_at }

    pub fn key_pem(&self) -> &[u8] { self.key_pem.as_bytes() }

    /// Write `ca.key` then `ca.crt`. A crash in between leaves no CA
    /// certificate, so the directory still reads as uninitialized.
    pub fn persist<S: CertStore>(&self, store: &S) -> Result<(), TrustError> {
        store.write(&CertFile::CaKey, self.key_pem())?;
        store.write(&CertFile::CaCert, self.cert.pem())
    }

    fn signer(&self) -> Result<(rcgen::Certificate, KeyPair), TrustError> {
        let key = KeyPair::from_pem(&self.key_pem)?;
        let pem = std::str::from_utf8(self.cert.pem())
            .map_err(|_| TrustError::Certificate("CA certificate is not valid PEM text".into()))?;
        let params = CertificateParams::from_ca_cert_pem(pem)?;
        let cert = params.self_signed(&key)?;
        Ok((cert, key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub common_name: String,
    pub sans: Vec<String>,
}

impl NodeIdentity {
    pub fn node(sans: Vec<String>) -> Self {
        NodeIdentity { common_name: NODE_COMMON_NAME.to_string(), sans }
    }
}

/// A freshly minted leaf certificate and its key.
pub struct NodeCertificate {
    pub cert_pem: String,
    key_pem: String,
    pub common_name: String,
    pub sans: Vec<String>,
    pub not_after: OffsetDateTime,
    pub ca_fingerprint: String,
}

impl fmt::Debug for NodeCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCertificate")
            .field("common_name", &self.common_name)
            .field("sans", &self.sans)
            .field("not_after", &self.not_after)
            .field("ca_fingerprint", &self.ca_fingerprint)
            .finish_non_exhaustive()
    }
}

impl NodeCertificate {
    pub fn key_pem(&self) -> &str { &self.key_pem }
}

/// Same shape as a node certificate; the common name is the SQL user.
pub type ClientCertificate = NodeCertificate;

#[derive(Debug, Clone, Copy)]
pub struct CertIssuer {
    ca_validity_days: u32,
    leaf_validity_days: u32,
}

impl CertIssuer {
    pub fn new(ca_validity_days: u32, leaf_validity_days: u32) -> Self {
        CertIssuer { ca_validity_days, leaf_validity_days }
    }

    pub fn from_config(cfg: &clusterkit_core::CertConfig) -> Self {
        CertIssuer::new(cfg.ca_validity_days, cfg.node_validity_days)
    }

    pub fn synthesize_ca(&self, common_name: &str) -> Result<CertificateAuthority, TrustError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + Duration::days(i64::from(self.ca_validity_days));

        let cert = params.self_signed(&key)?;
        let ca = CaCertificate { pem: cert.pem().into_bytes(), der: cert.der().to_vec() };
        tracing::info!(common_name, fingerprint = %ca.fingerprint(), "created cluster CA");
        Ok(CertificateAuthority { cert: ca, key_pem: key.serialize_pem(), created_at: now })
    }

    /// Sign a new leaf certificate without touching disk.
    pub fn mint(&self, identity: &NodeIdentity, ca: &CertificateAuthority) -> Result<NodeCertificate, TrustError> {
        let (ca_cert, ca_key) = ca.signer()?;
        let mut params = CertificateParams::new(identity.sans.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, identity.common_name.as_str());
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        params.use_authority_key_identifier_extension = true;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + Duration::days(i64::from(self.leaf_validity_days));
        let not_after = params.not_after;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &ca_cert, &ca_key)?;
        Ok(NodeCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            common_name: identity.common_name.clone(),
            sans: identity.sans.clone(),
            not_after,
            ca_fingerprint: ca.certificate().fingerprint(),
        })
    }

    /// Mint and persist `node.key` then `node.crt`. The old `node.crt` is
    /// removed first, so a failure part way leaves no certificate behind.
    pub fn issue<S: CertStore>(
        &self,
        store: &S,
        identity: &NodeIdentity,
        ca: &CertificateAuthority,
    ) -> Result<NodeCertificate, TrustError> {
        let issued = self.mint(identity, ca)?;
        store.remove(&CertFile::NodeCert)?;
        store.write(&CertFile::NodeKey, issued.key_pem.as_bytes())?;
        store.write(&CertFile::NodeCert, issued.cert_pem.as_bytes())?;
        tracing::info!(sans = ?issued.sans, not_after = %issued.not_after, "issued node certificate");
        Ok(issued)
    }

    /// Client certificate for SQL user `user`, as `client.<user>.{key,crt}`.
    pub fn issue_client<S: CertStore>(
        &self,
        store: &S,
        user: &str,
        ca: &CertificateAuthority,
    ) -> Result<ClientCertificate, TrustError> {
        if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(TrustError::Certificate(format!("invalid SQL user name {:?}", user)));
        }
        let identity = NodeIdentity { common_name: user.to_string(), sans: Vec::new() };
        let issued = self.mint(&identity, ca)?;
        store.remove(&CertFile::ClientCert(user.to_string()))?;
        store.write(&CertFile::ClientKey(user.to_string()), issued.key_pem.as_bytes())?;
        store.write(&CertFile::ClientCert(user.to_string()), issued.cert_pem.as_bytes())?;
        tracing::info!(user, "issued client certificate");
        Ok(issued)
    }
}

/// `Ok(true)` when `cert_pem` parses and carries a valid signature by `ca`.
pub fn verify_issued(cert_pem: &[u8], ca: &CaCertificate) -> Result<bool, TrustError> {
    let (_, pem) = parse_x509_pem(cert_pem).map_err(|e| TrustError::Certificate(format!("not a PEM certificate: {e}")))?;
    let leaf = pem.parse_x509().map_err(|e| TrustError::Certificate(format!("invalid certificate: {e}")))?;
    let signed = ca.with_x509(|ca| {
        leaf.issuer().as_raw() == ca.subject().as_raw() && leaf.verify_signature(Some(ca.public_key())).is_ok()
    })?;
    Ok(signed)
}

/// `Ok(true)` when `key_pem` is the private key for the certificate in `cert_pem`.
pub fn key_matches(cert_pem: &[u8], key_pem: &[u8]) -> Result<bool, TrustError> {
    let (_, pem) = parse_x509_pem(cert_pem).map_err(|e| TrustError::Certificate(format!("not a PEM certificate: {e}")))?;
    let cert = pem.parse_x509().map_err(|e| TrustError::Certificate(format!("invalid certificate: {e}")))?;
    let key_pem = std::str::from_utf8(key_pem).map_err(|_| TrustError::Certificate("key is not valid PEM text".into()))?;
    let key = KeyPair::from_pem(key_pem)?;
    let matches = &*cert.public_key().subject_public_key.data == key.public_key_raw();
    Ok(matches)
}

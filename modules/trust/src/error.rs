use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("no CA certificate could be fetched from [{peers}] after {attempts} attempt(s)")]
    CaTimeout { peers: String, attempts: u32 },
    #[error("trust conflict: {0}")]
    TrustConflict(String),
    #[error("cannot write {path} securely: {source}")]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CA private key {path} is missing; copy it from the originating node out of band")]
    MissingCaKey { path: PathBuf },
    #[error("no CA certificate at {path}")]
    MissingCa { path: PathBuf },
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("CA exchange: {0}")]
    Exchange(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot {action} from state {state}")]
    InvalidState { action: &'static str, state: String },
}

impl From<rcgen::Error> for TrustError {
    fn from(e: rcgen::Error) -> Self {
        TrustError::Certificate(e.to_string())
    }
}

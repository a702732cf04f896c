use clusterkit_core::ExecError;
use std::path::PathBuf;
use thiserror::Error;

use crate::Version;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid migration filename {path}: expected NNN_description.sql")]
    FileParse { path: PathBuf },
    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion { version: Version, first: PathBuf, second: PathBuf },
    #[error("migration {version} ({file}) failed: {source}")]
    SqlExecution {
        version: Version,
        file: PathBuf,
        #[source]
        source: ExecError,
    },
    #[error("schema_migrations access failed: {0}")]
    Tracking(#[source] ExecError),
    #[error("no version can follow {path}")]
    VersionExhausted { path: PathBuf },
    #[error("invalid migration name {0:?}")]
    InvalidName(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

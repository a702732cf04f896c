use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::TrustError;

/// Well-known files in a node's certificate directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertFile {
    CaCert,
    CaKey,
    NodeCert,
    NodeKey,
    ClientCert(String),
    ClientKey(String),
}

impl CertFile {
    pub fn file_name(&self) -> String {
        match self {
            CertFile::CaCert => "ca.crt".to_string(),
            CertFile::CaKey => "ca.key".to_string(),
            CertFile::NodeCert => "node.crt".to_string(),
            CertFile::NodeKey => "node.key".to_string(),
            CertFile::ClientCert(user) => format!("client.{}.crt", user),
            CertFile::ClientKey(user) => format!("client.{}.key", user),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, CertFile::CaKey | CertFile::NodeKey | CertFile::ClientKey(_))
    }
}

pub trait CertStore {
    /// `Ok(None)` when the file does not exist.
    fn read(&self, file: &CertFile) -> Result<Option<Vec<u8>>, TrustError>;

    /// Replace `file` atomically. Secret files are never readable by
    /// group or others, not even briefly.
    fn write(&self, file: &CertFile, contents: &[u8]) -> Result<(), TrustError>;

    /// Delete `file`. A file that is already absent is not an error.
    fn remove(&self, file: &CertFile) -> Result<(), TrustError>;

    fn location(&self, file: &CertFile) -> PathBuf;

    fn contains(&self, file: &CertFile) -> Result<bool, TrustError> {
        Ok(self.read(file)?.is_some())
    }
}

impl<T: CertStore + ?Sized> CertStore for &T {
    fn read(&self, file: &CertFile) -> Result<Option<Vec<u8>>, TrustError> {
        (**self).read(file)
    }

    fn write(&self, file: &CertFile, contents: &[u8]) -> Result<(), TrustError> {
        (**self).write(file, contents)
    }

    fn remove(&self, file: &CertFile) -> Result<(), TrustError> {
        (**self).remove(file)
    }

    fn location(&self, file: &CertFile) -> PathBuf {
        (**self).location(file)
    }
}

/// Certificate directory on local disk, in the layout `cockroach` expects.
#[derive(Debug, Clone)]
pub struct FsCertStore {
    dir: PathBuf,
}

impl FsCertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FsCertStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn ensure_dir(&self) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir)
    }
}

impl CertStore for FsCertStore {
    fn read(&self, file: &CertFile) -> Result<Option<Vec<u8>>, TrustError> {
        let path = self.location(file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TrustError::Io { path, source }),
        }
    }

    fn write(&self, file: &CertFile, contents: &[u8]) -> Result<(), TrustError> {
        let path = self.location(file);
        let denied = |source: io::Error| TrustError::Permission { path: path.clone(), source };

        self.ensure_dir().map_err(denied)?;
        // NamedTempFile is created with O_EXCL and mode 0600.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file.file_name()))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(denied)?;
        #[cfg(unix)]
        if !file.is_secret() {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file().set_permissions(fs::Permissions::from_mode(0o644)).map_err(denied)?;
        }
        tmp.write_all(contents).map_err(denied)?;
        tmp.as_file().sync_all().map_err(denied)?;
        tmp.persist(&path).map_err(|e| denied(e.error))?;

        #[cfg(unix)]
        if file.is_secret() {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).map_err(denied)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(denied(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("mode {:o} exposes the key to other users", mode & 0o777),
                )));
            }
        }
        tracing::debug!(path = %path.display(), secret = file.is_secret(), "wrote certificate file");
        Ok(())
    }

    fn remove(&self, file: &CertFile) -> Result<(), TrustError> {
        let path = self.location(file);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed certificate file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TrustError::Permission { path, source }),
        }
    }

    fn location(&self, file: &CertFile) -> PathBuf {
        self.dir.join(file.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_match_cockroach_layout() {
        assert_eq!(CertFile::CaCert.file_name(), "ca.crt");
        assert_eq!(CertFile::NodeKey.file_name(), "node.key");
        assert_eq!(CertFile::ClientCert("root".into()).file_name(), "client.root.crt");
        assert!(CertFile::CaKey.is_secret());
        assert!(CertFile::ClientKey("root".into()).is_secret());
        assert!(!CertFile::NodeCert.is_secret());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCertStore::new(dir.path().join("certs"));
        assert_eq!(store.read(&CertFile::CaCert).unwrap(), None);
        assert!(!store.contains(&CertFile::CaCert).unwrap());
    }

    #[test]
    fn write_replaces_contents_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCertStore::new(dir.path().join("certs"));
        store.write(&CertFile::CaCert, b"first").unwrap();
        store.write(&CertFile::CaCert, b"second").unwrap();
        assert_eq!(store.read(&CertFile::CaCert).unwrap().unwrap(), b"second");
        let names: Vec<_> = fs::read_dir(store.dir()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("ca.crt")]);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCertStore::new(dir.path().join("certs"));
        store.remove(&CertFile::NodeCert).unwrap();
        store.write(&CertFile::NodeCert, b"cert").unwrap();
        store.remove(&CertFile::NodeCert).unwrap();
        assert!(!store.contains(&CertFile::NodeCert).unwrap());
        store.remove(&CertFile::NodeCert).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FsCertStore::new(dir.path().join("certs"));
        store.write(&CertFile::NodeKey, b"key").unwrap();
        store.write(&CertFile::NodeCert, b"cert").unwrap();
        let mode = |f: &CertFile| fs::metadata(store.location(f)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&CertFile::NodeKey), 0o600);
        assert_eq!(mode(&CertFile::NodeCert), 0o644);
        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn unwritable_location_is_a_permission_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("certs");
        fs::write(&blocker, b"not a directory").unwrap();
        let store = FsCertStore::new(&blocker);
        let err = store.write(&CertFile::CaKey, b"key").unwrap_err();
        assert!(matches!(err, TrustError::Permission { .. }));
    }
}

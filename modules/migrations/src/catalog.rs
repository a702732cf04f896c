use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::MigrationError;
use crate::tracker::TRACKING_TABLE;

pub type Version = i64;

/// Zero-padding of the version prefix in generated filenames.
pub const VERSION_WIDTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: Version,
    /// File stem, e.g. `003_add_x`. Recorded as the migration name.
    pub name: String,
    pub body: String,
    pub source_path: PathBuf,
}

fn file_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)_([A-Za-z0-9_]+)\.sql$").expect("migration filename pattern is valid"))
}

/// Split `NNN_description.sql` into its version and stem.
pub fn parse_file_name(file_name: &str) -> Option<(Version, String)> {
    let caps = file_name_pattern().captures(file_name)?;
    let version: Version = caps[1].parse().ok()?;
    if version <= 0 { return None; }
    let stem = file_name.strip_suffix(".sql")?.to_string();
    Some((version, stem))
}

/// File-backed catalog. Every call re-reads the directory, so `create` and
/// `list` never disagree.
#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    dir: PathBuf,
}

impl MigrationCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MigrationCatalog { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    /// All migrations, ascending by version.
    pub fn list(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        if !self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "migrations directory does not exist");
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if !path.is_file() { continue; }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.ends_with(".sql") { continue; }
            let (version, name) = parse_file_name(&file_name).ok_or_else(|| MigrationError::FileParse { path: path.clone() })?;
            let body = fs::read_to_string(&path).map_err(io_err(&path))?;
            files.push(MigrationFile { version, name, body, source_path: path });
        }
        files.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.source_path.cmp(&b.source_path)));
        for pair in files.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(MigrationError::DuplicateVersion {
                    version: pair[0].version,
                    first: pair[0].source_path.clone(),
                    second: pair[1].source_path.clone(),
                });
            }
        }
        Ok(files)
    }

    /// Migrations with a version above `current`, ascending.
    pub fn pending(&self, current: Version) -> Result<Vec<MigrationFile>, MigrationError> {
        Ok(self.list()?.into_iter().filter(|m| m.version > current).collect())
    }

    pub fn next_version(&self) -> Result<Version, MigrationError> {
        match self.list()?.last() {
            None => Ok(1),
            Some(m) => m
                .version
                .checked_add(1)
                .ok_or_else(|| MigrationError::VersionExhausted { path: m.source_path.clone() }),
        }
    }

    /// Write a new templated migration at `next_version()` and return its path.
    pub fn create(&self, name: &str) -> Result<PathBuf, MigrationError> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrationError::InvalidName(name.to_string()));
        }
        let version = self.next_version()?;
        let stem = format!("{:0width$}_{}", version, slug, width = VERSION_WIDTH);
        fs::create_dir_all(&self.dir).map_err(|source| MigrationError::Io { path: self.dir.clone(), source })?;
        let path = self.dir.join(format!("{}.sql", stem));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| MigrationError::Io { path: path.clone(), source })?;
        file.write_all(template(version, &slug, &stem).as_bytes())
            .map_err(|source| MigrationError::Io { path: path.clone(), source })?;
        tracing::info!(version, path = %path.display(), "created migration");
        Ok(path)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MigrationError {
    let path = path.to_path_buf();
    move |source| MigrationError::Io { path, source }
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn title(slug: &str) -> String {
    slug.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(f) => f.to_ascii_uppercase().to_string() + cs.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn template(version: Version, slug: &str, stem: &str) -> String {
    let created = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new());
    format!(
        "-- Migration {version:0width$}: {title}\n\
         -- Created: {created}\n\
         --\n\
         -- Statements must be safe to run more than once:\n\
         -- use CREATE ... IF NOT EXISTS and INSERT ... ON CONFLICT DO NOTHING.\n\
         \n\
         \n\
         -- Register this migration\n\
         INSERT INTO {table} (version, name)\n\
         VALUES ({version}, '{stem}')\n\
         ON CONFLICT (version) DO NOTHING;\n",
        version = version,
        width = VERSION_WIDTH,
        title = title(slug),
        created = created,
        table = TRACKING_TABLE,
        stem = stem,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn parses_file_names() {
        assert_eq!(parse_file_name("001_init.sql"), Some((1, "001_init".to_string())));
        assert_eq!(parse_file_name("0042_add_index.sql"), Some((42, "0042_add_index".to_string())));
        assert_eq!(parse_file_name("0042_add-index.sql"), None);
        assert_eq!(parse_file_name("init.sql"), None);
        assert_eq!(parse_file_name("001init.sql"), None);
        assert_eq!(parse_file_name("001_.sql"), None);
        assert_eq!(parse_file_name("000_zero.sql"), None);
        assert_eq!(parse_file_name("99999999999999999999_big.sql"), None);
    }

    #[test]
    fn lists_in_version_order_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "010_ten.sql", "SELECT 10;");
        write(dir.path(), "002_two.sql", "SELECT 2;");
        write(dir.path(), "001_one.sql", "SELECT 1;");
        write(dir.path(), "README.md", "notes");
        fs::create_dir(dir.path().join("999_not_a_file.sql")).unwrap();
        let cat = MigrationCatalog::new(dir.path());
        let list = cat.list().unwrap();
        assert_eq!(list.iter().map(|m| m.version).collect::<Vec<_>>(), vec![1, 2, 10]);
        assert_eq!(list[1].name, "002_two");
        assert_eq!(list[1].body, "SELECT 2;");
        assert_eq!(cat.next_version().unwrap(), 11);
        assert_eq!(cat.pending(2).unwrap().len(), 1);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cat = MigrationCatalog::new(dir.path().join("nope"));
        assert!(cat.list().unwrap().is_empty());
        assert_eq!(cat.next_version().unwrap(), 1);
    }

    #[test]
    fn malformed_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_ok.sql", "");
        write(dir.path(), "add_users.sql", "");
        let err = MigrationCatalog::new(dir.path()).list().unwrap_err();
        assert!(matches!(err, MigrationError::FileParse { ref path } if path.ends_with("add_users.sql")));
    }

    #[test]
    fn duplicate_versions_fail_list_and_create() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "003_a.sql", "");
        write(dir.path(), "3_b.sql", "");
        let cat = MigrationCatalog::new(dir.path());
        assert!(matches!(cat.list(), Err(MigrationError::DuplicateVersion { version: 3, .. })));
        assert!(matches!(cat.create("add_x"), Err(MigrationError::DuplicateVersion { version: 3, .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn create_uses_next_padded_version() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_one.sql", "");
        write(dir.path(), "002_two.sql", "");
        let cat = MigrationCatalog::new(dir.path());
        let path = cat.create("add_x").unwrap();
        assert_eq!(path.file_name().unwrap(), "003_add_x.sql");
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("-- Migration 003: Add X\n"));
        assert!(body.contains("VALUES (3, '003_add_x')"));
        assert!(body.contains("ON CONFLICT (version) DO NOTHING;"));
        let list = cat.list().unwrap();
        assert_eq!(list.last().unwrap().version, 3);
    }

    #[test]
    fn last_possible_version_has_no_successor() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), &format!("{}_last.sql", Version::MAX), "");
        let cat = MigrationCatalog::new(dir.path());
        assert!(matches!(cat.next_version(), Err(MigrationError::VersionExhausted { .. })));
        assert!(matches!(cat.create("after"), Err(MigrationError::VersionExhausted { .. })));
    }

    #[test]
    fn create_slugifies_and_makes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cat = MigrationCatalog::new(dir.path().join("migrations"));
        let path = cat.create("Add Peer Reputation!").unwrap();
        assert_eq!(path.file_name().unwrap(), "001_add_peer_reputation.sql");
        assert!(matches!(cat.create(" -- "), Err(MigrationError::InvalidName(_))));
    }
}

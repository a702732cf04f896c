use clusterkit_core::DatabaseExecutor;
use serde::Serialize;
use std::path::PathBuf;

use crate::catalog::{MigrationCatalog, Version};
use crate::error::MigrationError;
use crate::tracker::{SchemaMigrationRecord, VersionTracker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateReport {
    pub applied: usize,
    pub applied_versions: Vec<Version>,
    pub current_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: Version,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub current_version: Version,
    pub applied: Vec<SchemaMigrationRecord>,
    pub pending: Vec<PendingMigration>,
}

/// Applies pending migrations in ascending order.
pub struct MigrationRunner<E> {
    catalog: MigrationCatalog,
    db: E,
}

impl<E: DatabaseExecutor> MigrationRunner<E> {
    pub fn new(catalog: MigrationCatalog, db: E) -> Self {
        MigrationRunner { catalog, db }
    }

    pub fn catalog(&self) -> &MigrationCatalog { &self.catalog }

    pub fn tracker(&self) -> VersionTracker<&E> {
        VersionTracker::new(&self.db)
    }

    /// Apply every migration above the recorded version, stopping at the
    /// first failure. A failed migration is not recorded, so the next run
    /// retries it; its statements may already have partially run.
    pub fn migrate(&self) -> Result<MigrateReport, MigrationError> {
        // Validate the catalog before touching the database.
        let files = self.catalog.list()?;
        let tracker = self.tracker();
        tracker.ensure_tracking_table()?;
        let current = tracker.current_version()?;
        tracing::info!(current_version = current, "schema version");

        let mut applied_versions = Vec::new();
        for m in files.into_iter().filter(|m| m.version > current) {
            tracing::info!(version = m.version, file = %m.source_path.display(), "applying migration");
            if let Err(source) = self.db.execute(&m.body) {
                tracing::warn!(version = m.version, error = %source, "migration failed, stopping");
                return Err(MigrationError::SqlExecution { version: m.version, file: m.source_path, source });
            }
            tracker.record_applied(m.version, &m.name)?;
            applied_versions.push(m.version);
        }

        let current_version = tracker.current_version()?;
        if applied_versions.is_empty() {
            tracing::info!(current_version, "schema up to date");
        } else {
            tracing::info!(applied = applied_versions.len(), current_version, "migrations applied");
        }
        Ok(MigrateReport { applied: applied_versions.len(), applied_versions, current_version })
    }

    /// Read-only: a database without a tracking table reports version 0.
    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let files = self.catalog.list()?;
        let tracker = self.tracker();
        let (current_version, applied) = if tracker.exists()? {
            (tracker.current_version()?, tracker.applied()?)
        } else {
            (0, Vec::new())
        };
        let pending = files
            .into_iter()
            .filter(|m| m.version > current_version)
            .map(|m| PendingMigration { version: m.version, name: m.name, path: m.source_path })
            .collect();
        Ok(MigrationStatus { current_version, applied, pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_executor::Db;
    use std::fs;
    use std::path::Path;

    fn logged(version: Version) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS apply_log (seq INTEGER PRIMARY KEY AUTOINCREMENT, version INTEGER NOT NULL);\n\
             INSERT INTO apply_log (version) VALUES ({version});\n"
        )
    }

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn log(db: &Db) -> Vec<i64> {
        db.query("SELECT version FROM apply_log ORDER BY seq")
            .unwrap()
            .into_iter()
            .filter_map(|r| r[0].as_i64())
            .collect()
    }

    #[test]
    fn applies_pending_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for v in 1..=3 {
            write(dir.path(), &format!("{:03}_step.sql", v), &logged(v));
        }
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(MigrationCatalog::new(dir.path()), &db);
        runner.tracker().ensure_tracking_table().unwrap();
        runner.tracker().record_applied(1, "001_step").unwrap();

        let report = runner.migrate().unwrap();
        assert_eq!(report.applied_versions, vec![2, 3]);
        assert_eq!(report.current_version, 3);
        assert_eq!(log(&db), vec![2, 3]);
        assert_eq!(runner.tracker().current_version().unwrap(), 3);
    }

    #[test]
    fn second_run_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", &logged(1));
        write(dir.path(), "002_b.sql", &logged(2));
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(MigrationCatalog::new(dir.path()), &db);

        assert_eq!(runner.migrate().unwrap().applied, 2);
        let rows_before = runner.tracker().applied().unwrap();
        let again = runner.migrate().unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.current_version, 2);
        assert_eq!(runner.tracker().applied().unwrap(), rows_before);
        assert_eq!(log(&db), vec![1, 2]);
    }

    #[test]
    fn stops_at_first_failure_and_retries_it() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", &logged(1));
        write(dir.path(), "002_broken.sql", "CREATE TABLE IF NOT EXISTS partial (x INTEGER);\nTHIS IS NOT SQL;");
        write(dir.path(), "003_c.sql", &logged(3));
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(MigrationCatalog::new(dir.path()), &db);

        let err = runner.migrate().unwrap_err();
        match err {
            MigrationError::SqlExecution { version, file, .. } => {
                assert_eq!(version, 2);
                assert!(file.ends_with("002_broken.sql"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.tracker().current_version().unwrap(), 1);
        assert_eq!(log(&db), vec![1]);
        // the broken body ran up to the failing statement
        assert!(db.table_exists("partial").unwrap());

        write(dir.path(), "002_broken.sql", "CREATE TABLE IF NOT EXISTS partial (x INTEGER);");
        let report = runner.migrate().unwrap();
        assert_eq!(report.applied_versions, vec![2, 3]);
        assert_eq!(log(&db), vec![1, 3]);
    }

    #[test]
    fn duplicate_versions_fail_before_any_sql() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "003_a.sql", &logged(3));
        write(dir.path(), "003_b.sql", &logged(3));
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(MigrationCatalog::new(dir.path()), &db);
        assert!(matches!(runner.migrate(), Err(MigrationError::DuplicateVersion { version: 3, .. })));
        assert!(!db.table_exists("schema_migrations").unwrap());
        assert!(!db.table_exists("apply_log").unwrap());
    }

    #[test]
    fn self_registering_bodies_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = MigrationCatalog::new(dir.path());
        let path = catalog.create("nodes").unwrap();
        let body = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("CREATE TABLE IF NOT EXISTS nodes (peer_id TEXT PRIMARY KEY);\n{body}")).unwrap();

        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(catalog, &db);
        let report = runner.migrate().unwrap();
        assert_eq!(report.current_version, 1);
        let applied = runner.tracker().applied().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "001_nodes");
    }

    #[test]
    fn status_lists_applied_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", &logged(1));
        write(dir.path(), "002_b.sql", &logged(2));
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(MigrationCatalog::new(dir.path()), &db);
        runner.tracker().ensure_tracking_table().unwrap();
        runner.tracker().record_applied(1, "001_a").unwrap();

        let status = runner.status().unwrap();
        assert_eq!(status.current_version, 1);
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.pending.iter().map(|p| p.version).collect::<Vec<_>>(), vec![2]);
        assert!(!db.table_exists("apply_log").unwrap());
    }

    #[test]
    fn status_does_not_create_the_tracking_table() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", &logged(1));
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::new(MigrationCatalog::new(dir.path()), &db);

        let status = runner.status().unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.applied.is_empty());
        assert_eq!(status.pending.len(), 1);
        assert!(!db.table_exists("schema_migrations").unwrap());
    }
}

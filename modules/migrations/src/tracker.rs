use clusterkit_core::executor::quote_literal;
use clusterkit_core::DatabaseExecutor;
use serde::Serialize;

use crate::catalog::Version;
use crate::error::MigrationError;

pub const TRACKING_TABLE: &str = "schema_migrations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMigrationRecord {
    pub version: Version,
    pub name: String,
    /// As rendered by the database.
    pub applied_at: Option<String>,
}

/// Durable record of applied migrations, kept in the database itself.
pub struct VersionTracker<E> {
    db: E,
}

impl<E: DatabaseExecutor> VersionTracker<E> {
    pub fn new(db: E) -> Self {
        VersionTracker { db }
    }

    pub fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        self.db
            .execute(&format!(
                "CREATE TABLE IF NOT EXISTS {TRACKING_TABLE} (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                );"
            ))
            .map_err(MigrationError::Tracking)
    }

    /// False until the first `ensure_tracking_table`.
    pub fn exists(&self) -> Result<bool, MigrationError> {
        self.db.table_exists(TRACKING_TABLE).map_err(MigrationError::Tracking)
    }

    /// Highest recorded version, `0` when nothing has been applied.
    pub fn current_version(&self) -> Result<Version, MigrationError> {
        let v = self
            .db
            .query_i64(&format!("SELECT COALESCE(MAX(version), 0) FROM {TRACKING_TABLE}"))
            .map_err(MigrationError::Tracking)?;
        Ok(v.unwrap_or(0))
    }

    /// Conflict-safe insert: a row that already exists, possibly written by
    /// another node, leaves the table untouched and is not an error.
    pub fn record_applied(&self, version: Version, name: &str) -> Result<(), MigrationError> {
        self.db
            .execute(&format!(
                "INSERT INTO {TRACKING_TABLE} (version, name) VALUES ({version}, {}) ON CONFLICT (version) DO NOTHING;",
                quote_literal(name)
            ))
            .map_err(MigrationError::Tracking)?;
        tracing::debug!(version, name, "recorded migration");
        Ok(())
    }

    pub fn applied(&self) -> Result<Vec<SchemaMigrationRecord>, MigrationError> {
        let rows = self
            .db
            .query(&format!("SELECT version, name, applied_at FROM {TRACKING_TABLE} ORDER BY version"))
            .map_err(MigrationError::Tracking)?;
        rows.into_iter()
            .map(|row| {
                let version = row.first().and_then(|v| v.as_i64());
                let name = row.get(1).and_then(|v| v.as_text());
                match (version, name) {
                    (Some(version), Some(name)) => Ok(SchemaMigrationRecord { version, name, applied_at: row.get(2).and_then(|v| v.as_text()) }),
                    _ => Err(MigrationError::Tracking(clusterkit_core::ExecError::Decode(format!("malformed {TRACKING_TABLE} row: {:?}", row)))),
                }
            })
            .collect()
    }
}

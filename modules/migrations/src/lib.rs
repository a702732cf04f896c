//! Forward-only schema migrations tracked inside the managed database.
//!
//! Migration files live in a directory as `NNN_description.sql`. Applied
//! versions are recorded in `schema_migrations` with a conflict-safe insert,
//! which is what makes concurrent runs from several nodes safe. There is no
//! rollback: undoing a change means writing a new migration.

mod catalog;
mod error;
mod runner;
mod tracker;

pub use catalog::{parse_file_name, MigrationCatalog, MigrationFile, Version, VERSION_WIDTH};
pub use error::MigrationError;
pub use runner::{MigrateReport, MigrationRunner, MigrationStatus, PendingMigration};
pub use tracker::{SchemaMigrationRecord, VersionTracker, TRACKING_TABLE};

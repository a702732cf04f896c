//! `DatabaseExecutor` backends: an embedded SQLite database and the
//! `cockroach sql` command-line client.

mod cockroach;
mod executor;
mod open;

pub use cockroach::CockroachCli;
pub use open::Db;

//! The database capability consumed by the migration engine.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The database rejected or failed a statement.
    #[error("statement failed: {source}")]
    Statement { source: BoxError },
    /// The database could not be reached at all.
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// The result could not be decoded into the expected shape.
    #[error("unexpected result: {0}")]
    Decode(String),
}

impl ExecError {
    pub fn statement(e: impl Into<BoxError>) -> Self {
        ExecError::Statement { source: e.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
        }
    }
}

/// Executes SQL against the live cluster.
///
/// `execute` accepts one or more `;`-separated statements and runs them in
/// order, stopping at the first failure. Statements are not wrapped in any
/// transaction beyond what the SQL itself declares.
pub trait DatabaseExecutor {
    fn execute(&self, sql: &str) -> Result<(), ExecError>;

    /// Run a single query and return its rows.
    fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, ExecError>;

    /// First column of the first row, if any.
    fn query_i64(&self, sql: &str) -> Result<Option<i64>, ExecError> {
        let rows = self.query(sql)?;
        match rows.first().and_then(|r| r.first()) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| ExecError::Decode(format!("expected integer, got {:?}", v))),
        }
    }

    /// Whether a table named `name` exists in the current database.
    fn table_exists(&self, name: &str) -> Result<bool, ExecError> {
        let n = self.query_i64(&format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = {}",
            quote_literal(name)
        ))?;
        Ok(n.unwrap_or(0) > 0)
    }
}

impl<T: DatabaseExecutor + ?Sized> DatabaseExecutor for &T {
    fn execute(&self, sql: &str) -> Result<(), ExecError> { (**self).execute(sql) }
    fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, ExecError> { (**self).query(sql) }
    fn table_exists(&self, name: &str) -> Result<bool, ExecError> { (**self).table_exists(name) }
}

/// Quote a string as a SQL literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Vec<SqlValue>>);

    impl DatabaseExecutor for Fixed {
        fn execute(&self, _sql: &str) -> Result<(), ExecError> { Ok(()) }
        fn query(&self, _sql: &str) -> Result<Vec<Vec<SqlValue>>, ExecError> { Ok(self.0.clone()) }
    }

    #[test]
    fn query_i64_reads_first_cell() {
        assert_eq!(Fixed(vec![vec![SqlValue::Integer(7)]]).query_i64("x").unwrap(), Some(7));
        assert_eq!(Fixed(vec![vec![SqlValue::Text(" 12 ".into())]]).query_i64("x").unwrap(), Some(12));
        assert_eq!(Fixed(vec![]).query_i64("x").unwrap(), None);
        assert_eq!(Fixed(vec![vec![SqlValue::Null]]).query_i64("x").unwrap(), None);
        assert!(matches!(Fixed(vec![vec![SqlValue::Text("abc".into())]]).query_i64("x"), Err(ExecError::Decode(_))));
    }

    #[test]
    fn table_exists_counts_matching_tables() {
        assert!(Fixed(vec![vec![SqlValue::Integer(1)]]).table_exists("schema_migrations").unwrap());
        assert!(!Fixed(vec![vec![SqlValue::Integer(0)]]).table_exists("schema_migrations").unwrap());
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(quote_literal("003_add_x"), "'003_add_x'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}

use crate::Db;
use clusterkit_core::{DatabaseExecutor, ExecError, SqlValue};
use rusqlite::types::ValueRef;

impl DatabaseExecutor for Db {
    fn execute(&self, sql: &str) -> Result<(), ExecError> {
        tracing::trace!(sql, "sqlite execute");
        self.conn.execute_batch(sql).map_err(ExecError::statement)
    }

    fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, ExecError> {
        let mut stmt = self.conn.prepare(sql).map_err(ExecError::statement)?;
        let cols = stmt.column_count();
        let mut rows = stmt.query([]).map_err(ExecError::statement)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(ExecError::statement)? {
            let mut values = Vec::with_capacity(cols);
            for i in 0..cols {
                let v = match row.get_ref(i).map_err(ExecError::statement)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(x) => SqlValue::Integer(x),
                    ValueRef::Real(x) => SqlValue::Real(x),
                    ValueRef::Text(t) | ValueRef::Blob(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                };
                values.push(v);
            }
            out.push(values);
        }
        Ok(out)
    }

    fn table_exists(&self, name: &str) -> Result<bool, ExecError> {
        Db::table_exists(self, name).map_err(ExecError::statement)
    }
}

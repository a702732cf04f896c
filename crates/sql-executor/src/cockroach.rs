use clusterkit_core::{DatabaseExecutor, ExecError, SqlValue};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Runs SQL through the `cockroach sql` client against a secure cluster.
#[derive(Debug, Clone)]
pub struct CockroachCli {
    pub binary: String,
    pub certs_dir: PathBuf,
    /// `host:port` of the SQL endpoint.
    pub host: String,
    pub database: String,
    /// SQL user to connect as. `None` leaves the client's default.
    pub user: Option<String>,
}

impl CockroachCli {
    pub fn new(binary: impl Into<String>, certs_dir: impl Into<PathBuf>, host: impl Into<String>, database: impl Into<String>) -> Self {
        CockroachCli { binary: binary.into(), certs_dir: certs_dir.into(), host: host.into(), database: database.into(), user: None }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Connection arguments shared by every invocation.
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "sql".to_string(),
            format!("--certs-dir={}", self.certs_dir.display()),
            format!("--host={}", self.host),
            format!("--database={}", self.database),
        ];
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            args.push(format!("--user={}", user));
        }
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args());
        cmd
    }

    fn run(&self, mut cmd: Command, stdin_sql: Option<&str>) -> Result<String, ExecError> {
        cmd.stdin(if stdin_sql.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Unavailable(format!("failed to spawn {}: {}", self.binary, e)))?;
        if let (Some(sql), Some(mut stdin)) = (stdin_sql, child.stdin.take()) {
            stdin
                .write_all(sql.as_bytes())
                .map_err(|e| ExecError::Unavailable(format!("failed to send SQL to {}: {}", self.binary, e)))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| ExecError::Unavailable(format!("{} did not finish: {}", self.binary, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecError::statement(format!("{} exited with {}: {}", self.binary, output.status, stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DatabaseExecutor for CockroachCli {
    fn execute(&self, sql: &str) -> Result<(), ExecError> {
        tracing::debug!(host = %self.host, database = %self.database, "cockroach sql execute");
        // Non-interactive input stops at the first failing statement.
        self.run(self.command(), Some(sql)).map(|_| ())
    }

    fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, ExecError> {
        let mut cmd = self.command();
        cmd.arg("--format=tsv").arg("-e").arg(sql);
        let out = self.run(cmd, None)?;
        Ok(parse_tsv(&out))
    }
}

/// Parse `--format=tsv` output: a header line followed by tab-separated rows.
fn parse_tsv(out: &str) -> Vec<Vec<SqlValue>> {
    out.lines()
        .skip(1)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            l.split('\t')
                .map(|cell| match cell {
                    "NULL" => SqlValue::Null,
                    s => s.parse::<i64>().map(SqlValue::Integer).unwrap_or_else(|_| SqlValue::Text(s.to_string())),
                })
                .collect()
        })
        .collect()
}

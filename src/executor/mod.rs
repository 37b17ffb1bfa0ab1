pub mod psql;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One result row: column names (shared by every row of a result) zipped
/// positionally with the row's values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl Row {
    /// Callers guarantee `values.len() == columns.len()`.
    fn new(columns: Arc<[String]>, values: Vec<String>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Value of the named column, if the result has such a column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| self.values[i].as_str())
    }

    /// Iterate `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    /// Decode the row into a typed record whose fields are named after the
    /// columns. Values stay text; extra columns are ignored.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueryError> {
        let object: serde_json::Map<String, serde_json::Value> = self
            .iter()
            .map(|(c, v)| (c.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|source| QueryError::Decode { source })
    }
}

/// What the executor should do when a query fails.
///
/// Every call site picks one explicitly: `Halt` for failures that end the
/// run, `Return` for checks whose failure the caller interprets itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Hand the error back without reporting it.
    Return,
    /// Report the failure (stderr lines at error level) and hand the error
    /// back for propagation to the top of the run.
    Halt,
}

/// Errors produced by query execution.
#[derive(Debug)]
pub enum QueryError {
    /// The client binary could not be started.
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
    /// Reading the client's output failed.
    Io { source: std::io::Error },
    /// The client exited non-zero or wrote to stderr.
    Execution {
        exit_code: Option<i32>,
        stderr: Vec<String>,
    },
    /// A data line did not have as many fields as the header.
    Parsing {
        line: usize,
        expected: usize,
        found: usize,
    },
    /// A column the caller decodes was absent from the result.
    MissingColumn { column: String },
    /// A row did not fit the record it was decoded into.
    Decode { source: serde_json::Error },
    /// A value could not be interpreted as the column's type.
    InvalidValue { column: String, value: String },
    /// The client did not finish within the configured bound.
    Timeout { after: Duration },
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Spawn { binary, source } => {
                write!(f, "failed to spawn {}: {}", binary.display(), source)
            }
            QueryError::Io { source } => write!(f, "I/O error while reading query output: {source}"),
            QueryError::Execution { exit_code, stderr } => {
                match exit_code {
                    Some(code) => write!(f, "query failed (exit status {code})")?,
                    None => write!(f, "query failed (terminated by signal)")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr.join(" / "))?;
                }
                Ok(())
            }
            QueryError::Parsing {
                line,
                expected,
                found,
            } => write!(
                f,
                "malformed query output at line {line}: expected {expected} fields, found {found}"
            ),
            QueryError::MissingColumn { column } => {
                write!(f, "query output is missing column {column:?}")
            }
            QueryError::Decode { source } => write!(f, "could not decode query row: {source}"),
            QueryError::InvalidValue { column, value } => {
                write!(f, "unexpected value {value:?} in column {column:?}")
            }
            QueryError::Timeout { after } => {
                write!(f, "query did not finish within {}s", after.as_secs_f64())
            }
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Spawn { source, .. } => Some(source),
            QueryError::Io { source } => Some(source),
            QueryError::Decode { source } => Some(source),
            _ => None,
        }
    }
}

/// Connection settings handed to the query client.
///
/// Passed to each child process explicitly; the collector's own
/// environment is never modified.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: String,
}

impl ConnectionParams {
    /// libpq environment variables for this connection. `None` means the
    /// variable must be removed from the child's environment.
    pub fn env(&self) -> [(&'static str, Option<String>); 5] {
        [
            ("PGHOST", Some(self.host.clone())),
            ("PGPORT", Some(self.port.to_string())),
            ("PGUSER", self.user.clone()),
            ("PGPASSWORD", self.password.clone()),
            ("PGDATABASE", Some(self.dbname.clone())),
        ]
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("dbname", &self.dbname)
            .finish()
    }
}

/// Runs SQL text against the monitored database and returns its rows.
///
/// No parameter binding: values must already be embedded in `query`.
pub trait QueryExecutor {
    async fn execute(&self, query: &str, on_error: OnError) -> Result<Vec<Row>, QueryError>;
}

/// Apply the reporting half of `on_error` to a failed query.
pub(crate) fn report_failure(err: &QueryError, on_error: OnError) {
    match on_error {
        OnError::Return => tracing::debug!(error = %err, "query failed, returning error to caller"),
        OnError::Halt => match err {
            QueryError::Execution { exit_code, stderr } => {
                tracing::error!(exit_code = ?exit_code, "got an error during query execution");
                for line in stderr {
                    tracing::error!("{line}");
                }
            }
            other => tracing::error!(error = %other, "got an error during query execution"),
        },
    }
}

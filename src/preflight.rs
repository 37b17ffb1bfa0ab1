/// Preflight checks run before any statistics are read: the database must be
/// reachable, the role a superuser, the server new enough, and pg_stat_plans
/// installed.
use crate::executor::{OnError, QueryError, QueryExecutor, Row};

/// Oldest supported `server_version_num` (PostgreSQL 9.1).
pub const MIN_SERVER_VERSION: u32 = 90100;

/// Extension the statistics are read from.
pub const STATS_EXTENSION: &str = "pg_stat_plans";

/// A named prerequisite that did not hold.
#[derive(Debug)]
pub enum ValidationError {
    /// `SELECT 1` failed.
    Unreachable { source: QueryError },
    /// A check's query failed.
    Query {
        check: &'static str,
        source: QueryError,
    },
    /// A check's query returned no value in the expected column.
    MissingValue {
        check: &'static str,
        column: &'static str,
    },
    NotSuperuser { value: String },
    UnparseableVersion { value: String },
    ServerTooOld { version: u32 },
    ExtensionMissing,
    /// The extension catalog itself could not be queried.
    ExtensionCatalogUnavailable { source: QueryError },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Unreachable { source } => write!(f, "database is not alive: {source}"),
            ValidationError::Query { check, source } => {
                write!(f, "{check} check failed: {source}")
            }
            ValidationError::MissingValue { check, column } => {
                write!(f, "{check} check returned no {column} value")
            }
            ValidationError::NotSuperuser { value } => write!(
                f,
                "database user isn't a superuser (is_superuser = {value:?})"
            ),
            ValidationError::UnparseableVersion { value } => {
                write!(f, "could not parse server_version_num {value:?}")
            }
            ValidationError::ServerTooOld { version } => write!(
                f,
                "PostgreSQL 9.1 or newer is required (server_version_num = {version})"
            ),
            ValidationError::ExtensionMissing => {
                write!(f, "extension {STATS_EXTENSION} isn't installed")
            }
            ValidationError::ExtensionCatalogUnavailable { source } => {
                write!(f, "could not read the pg_extension catalog: {source}")
            }
        }
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ValidationError::Unreachable { source }
            | ValidationError::Query { source, .. }
            | ValidationError::ExtensionCatalogUnavailable { source } => Some(source),
            _ => None,
        }
    }
}

fn first_value<'a>(rows: &'a [Row], column: &str) -> Option<&'a str> {
    rows.first().and_then(|row| row.get(column))
}

/// Run every preflight check in order, stopping at the first that fails.
/// Returns the server's `server_version_num`.
pub async fn validate<E: QueryExecutor>(executor: &E) -> Result<u32, ValidationError> {
    tracing::debug!("pinging database");
    executor
        .execute("SELECT 1", OnError::Halt)
        .await
        .map_err(|source| ValidationError::Unreachable { source })?;

    let rows = executor
        .execute("SHOW is_superuser", OnError::Halt)
        .await
        .map_err(|source| ValidationError::Query {
            check: "superuser",
            source,
        })?;
    let superuser = first_value(&rows, "is_superuser").ok_or(ValidationError::MissingValue {
        check: "superuser",
        column: "is_superuser",
    })?;
    if superuser != "on" {
        return Err(ValidationError::NotSuperuser {
            value: superuser.to_string(),
        });
    }

    let rows = executor
        .execute("SHOW server_version_num", OnError::Halt)
        .await
        .map_err(|source| ValidationError::Query {
            check: "server version",
            source,
        })?;
    let raw = first_value(&rows, "server_version_num").ok_or(ValidationError::MissingValue {
        check: "server version",
        column: "server_version_num",
    })?;
    let version: u32 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::UnparseableVersion {
            value: raw.to_string(),
        })?;
    if version < MIN_SERVER_VERSION {
        return Err(ValidationError::ServerTooOld { version });
    }
    tracing::debug!(version, "server version ok");

    // Older servers have no pg_extension; that failure is ours to report.
    let query = format!(
        "SELECT COUNT(*) AS extension_count FROM pg_extension WHERE extname = '{STATS_EXTENSION}'"
    );
    let rows = executor
        .execute(&query, OnError::Return)
        .await
        .map_err(|source| ValidationError::ExtensionCatalogUnavailable { source })?;
    if first_value(&rows, "extension_count") != Some("1") {
        return Err(ValidationError::ExtensionMissing);
    }

    Ok(version)
}

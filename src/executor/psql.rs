/// Subprocess query strategy: run each query through `psql` in unaligned
/// mode and turn its delimited stdout into rows.
use super::{report_failure, ConnectionParams, OnError, QueryError, QueryExecutor, Row};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Column separator passed to `psql -F`. Rare enough not to collide with
/// ordinary query results.
pub const DELIMITER: char = '\u{2764}';

/// Prepended to every query so the collector can exclude its own
/// statements from the statistics it reads.
pub const QUERY_MARKER: &str = "/* pganalyze-collector */";

/// Runs queries by spawning one `psql` process per call.
#[derive(Debug, Clone)]
pub struct PsqlExecutor {
    binary: PathBuf,
    params: ConnectionParams,
    timeout: Duration,
    settings: Vec<(String, String)>,
}

impl PsqlExecutor {
    pub fn new(binary: impl Into<PathBuf>, params: ConnectionParams, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            params,
            timeout,
            settings: Vec::new(),
        }
    }

    /// Apply a server setting to every session this executor opens. Settings
    /// are sent as connection options, so queries stay single statements.
    pub fn with_setting(mut self, name: &str, value: &str) -> Self {
        self.settings.push((name.to_string(), value.to_string()));
        self
    }

    /// `PGOPTIONS` value for the configured settings, if there are any.
    pub fn pgoptions(&self) -> Option<String> {
        if self.settings.is_empty() {
            return None;
        }
        let options: Vec<String> = self
            .settings
            .iter()
            .map(|(name, value)| format!("-c {}={}", name, escape_option(value)))
            .collect();
        Some(options.join(" "))
    }

    /// Run the client and check its exit status and stderr, returning stdout.
    async fn run(&self, query: &str) -> Result<String, QueryError> {
        let mut command = Command::new(&self.binary);
        command
            .args(build_args(query))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in self.params.env() {
            match value {
                Some(v) => command.env(key, v),
                None => command.env_remove(key),
            };
        }
        if let Some(options) = self.pgoptions() {
            command.env("PGOPTIONS", options);
        }

        let start = Instant::now();
        let child = command.spawn().map_err(|e| QueryError::Spawn {
            binary: self.binary.clone(),
            source: e,
        })?;

        // Both pipes are drained together; dropping the future on timeout
        // kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| QueryError::Timeout {
                after: self.timeout,
            })?
            .map_err(|e| QueryError::Io { source: e })?;

        let stderr: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();
        tracing::debug!(
            exit_code = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            stderr_lines = stderr.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "psql finished"
        );

        if !stderr.is_empty() || !output.status.success() {
            return Err(QueryError::Execution {
                exit_code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl QueryExecutor for PsqlExecutor {
    async fn execute(&self, query: &str, on_error: OnError) -> Result<Vec<Row>, QueryError> {
        tracing::debug!(query, "running query");
        let result = match self.run(query).await {
            Ok(stdout) => parse_unaligned(&stdout, DELIMITER),
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            report_failure(e, on_error);
        }
        result
    }
}

/// libpq splits `PGOPTIONS` on unescaped whitespace.
fn escape_option(value: &str) -> String {
    value.replace('\\', "\\\\").replace(' ', "\\ ")
}

/// Build the `psql` argument list. Connection settings never appear here;
/// they travel in the child's environment. `--quiet` keeps command tags such
/// as `SET` out of stdout, where they would be read as a header.
fn build_args(query: &str) -> Vec<String> {
    vec![
        format!("-F{DELIMITER}"),
        "--no-align".to_string(),
        "--no-password".to_string(),
        "--no-psqlrc".to_string(),
        "--quiet".to_string(),
        "-c".to_string(),
        format!("{QUERY_MARKER}{query}"),
    ]
}

/// Parse unaligned `psql` output into rows.
///
/// The last line is the row-count footer and is dropped. The first remaining
/// line names the columns; every following line must split into exactly as
/// many fields.
pub fn parse_unaligned(stdout: &str, delimiter: char) -> Result<Vec<Row>, QueryError> {
    let mut lines: Vec<&str> = stdout.lines().collect();
    lines.pop();

    let mut lines = lines.into_iter();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Arc<[String]> = header.split(delimiter).map(str::to_string).collect();

    lines
        .enumerate()
        .map(|(i, line)| {
            let values: Vec<String> = line.split(delimiter).map(str::to_string).collect();
            if values.len() != columns.len() {
                return Err(QueryError::Parsing {
                    // 1-based, counting the header as line 1
                    line: i + 2,
                    expected: columns.len(),
                    found: values.len(),
                });
            }
            Ok(Row::new(Arc::clone(&columns), values))
        })
        .collect()
}

/// Look for an executable `psql` on the given `PATH` value.
pub fn find_psql(path_var: &OsStr) -> Option<PathBuf> {
    find_executable("psql", path_var)
}

fn find_executable(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "db.example".to_string(),
            port: 5499,
            user: Some("collector".to_string()),
            password: None,
            dbname: "appdb".to_string(),
        }
    }

    #[cfg(unix)]
    fn fake_psql(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("psql");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_drops_footer_and_zips_header() {
        let out = "a❤b\n1❤x\n2❤y\n3❤z\n(3 rows)\n";
        let rows = parse_unaligned(out, DELIMITER).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].iter().collect::<Vec<_>>(), vec![("a", "1"), ("b", "x")]);
        assert_eq!(rows[2].get("a"), Some("3"));
        assert_eq!(rows[2].get("b"), Some("z"));
        assert!(rows.iter().all(|r| r.get("(3 rows)").is_none()));
    }

    #[test]
    fn test_parse_header_only_yields_no_rows() {
        let rows = parse_unaligned("a❤b\n(0 rows)\n", DELIMITER).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_unaligned("", DELIMITER).unwrap().is_empty());
        // Commands without a result set print only their tag
        assert!(parse_unaligned("SET\n", DELIMITER).unwrap().is_empty());
    }

    #[test]
    fn test_parse_keeps_empty_trailing_values() {
        let rows = parse_unaligned("a❤b\n1❤\n(1 row)\n", DELIMITER).unwrap();
        assert_eq!(rows[0].get("b"), Some(""));
    }

    #[test]
    fn test_parse_field_count_mismatch_is_error() {
        let err = parse_unaligned("a❤b\n1❤x\n2\n(2 rows)\n", DELIMITER).unwrap_err();
        match err {
            QueryError::Parsing {
                line,
                expected,
                found,
            } => {
                assert_eq!(line, 3);
                assert_eq!(expected, 2);
                assert_eq!(found, 1);
            }
            other => panic!("expected parsing error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_extra_field_is_error() {
        let err = parse_unaligned("a❤b\n1❤x❤extra\n(1 row)\n", DELIMITER).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Parsing {
                expected: 2,
                found: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_handles_crlf() {
        let rows = parse_unaligned("a❤b\r\n1❤x\r\n(1 row)\r\n", DELIMITER).unwrap();
        assert_eq!(rows[0].get("b"), Some("x"));
    }

    #[test]
    fn test_build_args_marks_query_and_sets_unaligned_mode() {
        let args = build_args("SELECT 1");
        assert_eq!(
            args,
            vec![
                "-F❤",
                "--no-align",
                "--no-password",
                "--no-psqlrc",
                "--quiet",
                "-c",
                "/* pganalyze-collector */SELECT 1",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_find_psql_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let psql = fake_psql(dir.path(), "exit 0");
        let path_var = std::env::join_paths([empty.path(), dir.path()]).unwrap();
        assert_eq!(find_psql(&path_var), Some(psql));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_psql_skips_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("psql"), "not a program").unwrap();
        let path_var = std::env::join_paths([dir.path()]).unwrap();
        assert_eq!(find_psql(&path_var), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_passes_connection_via_environment() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(
            dir.path(),
            r#"printf 'host❤port❤user❤password❤db\n%s❤%s❤%s❤%s❤%s\n(1 row)\n' "$PGHOST" "$PGPORT" "$PGUSER" "${PGPASSWORD-unset}" "$PGDATABASE""#,
        );
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let rows = executor.execute("SELECT 1", OnError::Halt).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("host"), Some("db.example"));
        assert_eq!(rows[0].get("port"), Some("5499"));
        assert_eq!(rows[0].get("user"), Some("collector"));
        assert_eq!(rows[0].get("password"), Some("unset"));
        assert_eq!(rows[0].get("db"), Some("appdb"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_sends_marked_query_as_last_argument() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(dir.path(), r#"printf 'query\n%s\n(1 row)\n' "$7""#);
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let rows = executor
            .execute("SHOW is_superuser", OnError::Halt)
            .await
            .unwrap();
        assert_eq!(
            rows[0].get("query"),
            Some("/* pganalyze-collector */SHOW is_superuser")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_quiet_mode_keeps_command_tags_out_of_rows() {
        let dir = tempfile::tempdir().unwrap();
        // Behaves like psql 15+: a multi-statement command prints the SET tag
        // before the result unless --quiet is given.
        let psql = fake_psql(
            dir.path(),
            "case \" $* \" in *\" --quiet \"*) ;; *) echo SET ;; esac\nprintf 'a❤b\\n1❤2\\n(1 row)\\n'",
        );
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let rows = executor
            .execute("SET search_path TO public; SELECT 1 AS a, 2 AS b", OnError::Halt)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), Some("1"));
        assert_eq!(rows[0].get("b"), Some("2"));
    }

    #[test]
    fn test_command_tag_before_header_is_a_parsing_error() {
        let err = parse_unaligned("SET\na❤b\n1❤2\n(1 row)\n", DELIMITER).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Parsing {
                line: 2,
                expected: 1,
                found: 2
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_sends_settings_as_connection_options() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(
            dir.path(),
            r#"printf 'options\n%s\n(1 row)\n' "${PGOPTIONS-unset}""#,
        );

        let plain = PsqlExecutor::new(&psql, params(), Duration::from_secs(10));
        assert_eq!(plain.pgoptions(), None);

        let executor = PsqlExecutor::new(&psql, params(), Duration::from_secs(10))
            .with_setting("pg_stat_plans.explain_format", "json")
            .with_setting("application_name", "pganalyze collector");
        let rows = executor.execute("SELECT 1", OnError::Halt).await.unwrap();
        assert_eq!(
            rows[0].get("options"),
            Some("-c pg_stat_plans.explain_format=json -c application_name=pganalyze\\ collector")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_stderr_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(
            dir.path(),
            "echo 'ERROR:  relation \"pg_extension\" does not exist' >&2\nexit 1",
        );
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let err = executor
            .execute("SELECT 1", OnError::Return)
            .await
            .unwrap_err();
        match err {
            QueryError::Execution { exit_code, stderr } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(
                    stderr,
                    vec!["ERROR:  relation \"pg_extension\" does not exist"]
                );
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_stderr_with_zero_exit_is_still_error() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(
            dir.path(),
            "printf 'a\\n1\\n(1 row)\\n'\necho 'WARNING:  something odd' >&2",
        );
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let err = executor
            .execute("SELECT 1", OnError::Halt)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Execution {
                exit_code: Some(0),
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_nonzero_exit_without_stderr_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(dir.path(), "exit 2");
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let err = executor
            .execute("SELECT 1", OnError::Return)
            .await
            .unwrap_err();
        match err {
            QueryError::Execution { exit_code, stderr } => {
                assert_eq!(exit_code, Some(2));
                assert!(stderr.is_empty());
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_drains_large_stderr_without_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        // Well past a pipe buffer on both streams
        let psql = fake_psql(
            dir.path(),
            "i=0\nwhile [ $i -lt 4000 ]; do echo \"NOTICE: line $i padding padding padding\" >&2; echo \"row $i padding padding padding padding\"; i=$((i+1)); done",
        );
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(30));

        let err = executor
            .execute("SELECT 1", OnError::Return)
            .await
            .unwrap_err();
        match err {
            QueryError::Execution { stderr, .. } => assert_eq!(stderr.len(), 4000),
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(dir.path(), "sleep 5");
        let executor = PsqlExecutor::new(psql, params(), Duration::from_millis(200));

        let start = Instant::now();
        let err = executor
            .execute("SELECT pg_sleep(5)", OnError::Return)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_malformed_output_is_parsing_error() {
        let dir = tempfile::tempdir().unwrap();
        let psql = fake_psql(dir.path(), "printf 'a❤b\\nonly-one\\n(1 row)\\n'");
        let executor = PsqlExecutor::new(psql, params(), Duration::from_secs(10));

        let err = executor
            .execute("SELECT 1, 2", OnError::Halt)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Parsing { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let executor = PsqlExecutor::new(
            "/nonexistent-dir/psql-xyz",
            params(),
            Duration::from_secs(10),
        );
        let err = executor
            .execute("SELECT 1", OnError::Return)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }
}

use crate::executor::psql::find_psql;
use crate::executor::ConnectionParams;
use crate::submit::DEFAULT_API_URL;
use serde::Deserialize;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;

/// Keys as they appear in the config file. Everything is optional here;
/// required keys are checked when resolving.
#[derive(Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_username: Option<String>,
    pub db_password: Option<String>,
    pub db_name: Option<String>,
    pub api_key: Option<String>,
    pub psql_binary: Option<PathBuf>,
    pub api_url: Option<String>,
    pub query_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigFile")
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_username", &self.db_username)
            .field(
                "db_password",
                &self.db_password.as_ref().map(|_| "***removed***"),
            )
            .field("db_name", &self.db_name)
            .field("api_key", &self.api_key)
            .field("psql_binary", &self.psql_binary)
            .field("api_url", &self.api_url)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .finish()
    }
}

/// Resolved collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub connection: ConnectionParams,
    pub api_key: String,
    pub psql_binary: Option<PathBuf>,
    pub api_url: String,
    pub query_timeout: Duration,
}

/// Errors produced while locating, reading or writing configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// None of the candidate paths is a readable regular file.
    NotFound { candidates: Vec<PathBuf> },
    /// The file is accessible to group or other users.
    InsecurePermissions { path: PathBuf, mode: u32 },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MissingFields {
        path: PathBuf,
        fields: Vec<&'static str>,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// No `psql_binary` configured and none found on `PATH`.
    PsqlNotFound,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound { candidates } => {
                let list: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
                write!(
                    f,
                    "couldn't find a readable config file (tried {}), perhaps create one with --generate-config?",
                    list.join(", ")
                )
            }
            ConfigError::InsecurePermissions { path, mode } => write!(
                f,
                "config file {} is accessible by other users (mode {:o}), please run `chmod go-rwx {}`",
                path.display(),
                mode,
                path.display()
            ),
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => write!(
                f,
                "failure while parsing {}: {}, please fix or create a new one with --generate-config",
                path.display(),
                source
            ),
            ConfigError::MissingFields { path, fields } => write!(
                f,
                "missing {} in config file {}, perhaps create one with --generate-config?",
                fields.join(" and "),
                path.display()
            ),
            ConfigError::Write { path, source } => {
                write!(f, "failed to write config file {}: {}", path.display(), source)
            }
            ConfigError::PsqlNotFound => write!(
                f,
                "couldn't find psql on PATH, please set psql_binary in the config file"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } | ConfigError::Write { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Default config locations, in lookup order.
pub fn default_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".pganalyze_collector.conf"));
    }
    candidates.push(PathBuf::from("/etc/pganalyze/collector.conf"));
    candidates
}

/// Return the first candidate that is a readable regular file.
pub fn locate(candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    for candidate in candidates {
        let metadata = match std::fs::metadata(candidate) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %candidate.display(), error = %e, "skipping config candidate");
                continue;
            }
        };
        if !metadata.is_file() {
            tracing::debug!(path = %candidate.display(), "config candidate isn't a regular file");
            continue;
        }
        check_permissions(candidate, &metadata)?;
        if let Err(e) = std::fs::File::open(candidate) {
            tracing::debug!(path = %candidate.display(), error = %e, "config candidate isn't readable");
            continue;
        }
        return Ok(candidate.clone());
    }
    Err(ConfigError::NotFound {
        candidates: candidates.to_vec(),
    })
}

#[cfg(unix)]
fn check_permissions(path: &Path, metadata: &std::fs::Metadata) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(ConfigError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path, _metadata: &std::fs::Metadata) -> Result<(), ConfigError> {
    Ok(())
}

/// Read and resolve a config file. `api_key` from the command line takes
/// precedence over the file's.
pub fn load(path: &Path, api_key: Option<&str>) -> Result<CollectorConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse(&contents, path, api_key)
}

fn parse(contents: &str, path: &Path, api_key: Option<&str>) -> Result<CollectorConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), config = ?file, "read config");
    file.resolve(path, api_key)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ConfigFile {
    fn resolve(self, path: &Path, api_key: Option<&str>) -> Result<CollectorConfig, ConfigError> {
        let db_name = non_empty(self.db_name);
        let api_key = non_empty(api_key.map(str::to_string)).or(non_empty(self.api_key));

        let (db_name, api_key) = match (db_name, api_key) {
            (Some(db_name), Some(api_key)) => (db_name, api_key),
            (db_name, api_key) => {
                let mut fields = Vec::new();
                if db_name.is_none() {
                    fields.push("db_name");
                }
                if api_key.is_none() {
                    fields.push("api_key");
                }
                return Err(ConfigError::MissingFields {
                    path: path.to_path_buf(),
                    fields,
                });
            }
        };

        Ok(CollectorConfig {
            connection: ConnectionParams {
                host: non_empty(self.db_host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: self.db_port.unwrap_or(DEFAULT_PORT),
                user: non_empty(self.db_username),
                password: non_empty(self.db_password),
                dbname: db_name,
            },
            api_key,
            psql_binary: self.psql_binary.filter(|p| !p.as_os_str().is_empty()),
            api_url: non_empty(self.api_url).unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            query_timeout: Duration::from_secs(
                self.query_timeout_secs
                    .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS),
            ),
        })
    }
}

impl CollectorConfig {
    /// The configured `psql`, or the first one found on `path_var`.
    pub fn resolve_psql(&self, path_var: &OsStr) -> Result<PathBuf, ConfigError> {
        if let Some(binary) = &self.psql_binary {
            return Ok(binary.clone());
        }
        let found = find_psql(path_var).ok_or(ConfigError::PsqlNotFound)?;
        tracing::debug!(psql = %found.display(), "using psql from PATH");
        Ok(found)
    }
}

/// Template written by `--generate-config`.
fn default_config(api_key: Option<&str>) -> String {
    let api_key = toml::Value::String(api_key.unwrap_or("fill_me_in").to_string());
    format!(
        "\
# pganalyze-collector configuration
api_key = {api_key}
db_name = \"fill_me_in\"
#db_username = \"\"
#db_password = \"\"
#db_host = \"{DEFAULT_HOST}\"
#db_port = {DEFAULT_PORT}
#psql_binary = \"/autodetected/from/$PATH\"
#api_url = \"{DEFAULT_API_URL}\"
#query_timeout_secs = {DEFAULT_QUERY_TIMEOUT_SECS}
"
    )
}

/// Write a fresh config file. Never overwrites an existing file.
pub fn write_default(path: &Path, api_key: Option<&str>) -> Result<(), ConfigError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
        .open(path)
        .and_then(|mut f| f.write_all(default_config(api_key).as_bytes()))
        .map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_private(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        path
    }

    #[test]
    fn test_parse_minimal_config_applies_defaults() {
        let config = parse(
            "api_key = \"abc\"\ndb_name = \"app\"\n",
            Path::new("c.conf"),
            None,
        )
        .unwrap();
        assert_eq!(config.api_key, "abc");
        assert_eq!(config.connection.dbname, "app");
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 5432);
        assert_eq!(config.connection.user, None);
        assert_eq!(config.connection.password, None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.query_timeout, Duration::from_secs(300));
        assert_eq!(config.psql_binary, None);
    }

    #[test]
    fn test_parse_full_config() {
        let contents = r#"
api_key = "abc"
db_name = "app"
db_username = "postgres"
db_password = "secret"
db_host = "10.0.0.5"
db_port = 6432
psql_binary = "/usr/lib/postgresql/9.3/bin/psql"
api_url = "http://localhost:3000/queries"
query_timeout_secs = 30
"#;
        let config = parse(contents, Path::new("c.conf"), None).unwrap();
        assert_eq!(config.connection.host, "10.0.0.5");
        assert_eq!(config.connection.port, 6432);
        assert_eq!(config.connection.user.as_deref(), Some("postgres"));
        assert_eq!(config.connection.password.as_deref(), Some("secret"));
        assert_eq!(
            config.psql_binary,
            Some(PathBuf::from("/usr/lib/postgresql/9.3/bin/psql"))
        );
        assert_eq!(config.api_url, "http://localhost:3000/queries");
        assert_eq!(config.query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_required_fields() {
        let err = parse("db_host = \"x\"\n", Path::new("c.conf"), None).unwrap_err();
        match err {
            ConfigError::MissingFields { fields, .. } => {
                assert_eq!(fields, vec!["db_name", "api_key"]);
            }
            other => panic!("expected missing fields, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_required_field_counts_as_missing() {
        let err = parse(
            "api_key = \"abc\"\ndb_name = \"\"\n",
            Path::new("c.conf"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingFields { ref fields, .. } if fields == &vec!["db_name"]));
        assert!(err.to_string().contains("--generate-config"));
    }

    #[test]
    fn test_command_line_api_key_wins() {
        let config = parse(
            "api_key = \"from-file\"\ndb_name = \"app\"\n",
            Path::new("c.conf"),
            Some("from-cli"),
        )
        .unwrap();
        assert_eq!(config.api_key, "from-cli");

        let config = parse("db_name = \"app\"\n", Path::new("c.conf"), Some("from-cli")).unwrap();
        assert_eq!(config.api_key, "from-cli");
    }

    #[test]
    fn test_unparseable_config() {
        let err = parse("api_key = \n", Path::new("broken.conf"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.conf"));
    }

    #[test]
    fn test_debug_output_hides_password() {
        let file: ConfigFile = toml::from_str("db_password = \"hunter2\"").unwrap();
        let rendered = format!("{file:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***removed***"));
    }

    #[test]
    fn test_locate_skips_missing_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.conf");
        let subdir = dir.path().join("subdir");
        std::fs::create_dir(&subdir).unwrap();
        let real = write_private(dir.path(), "real.conf", "api_key = \"a\"\n");

        let found = locate(&[missing, subdir, real.clone()]).unwrap();
        assert_eq!(found, real);
    }

    #[test]
    fn test_locate_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate(&[dir.path().join("nope.conf")]).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { ref candidates } if candidates.len() == 1));
        assert!(err.to_string().contains("nope.conf"));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_rejects_world_readable_config() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = write_private(dir.path(), "open.conf", "api_key = \"a\"\n");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = locate(&[path]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InsecurePermissions { mode: 0o644, .. }
        ));
        assert!(err.to_string().contains("chmod go-rwx"));
    }

    #[test]
    fn test_generated_config_loads_once_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.conf");
        write_default(&path, Some("my-key")).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        assert_eq!(locate(&[path.clone()]).unwrap(), path);
        let config = load(&path, None).unwrap();
        assert_eq!(config.api_key, "my-key");
        assert_eq!(config.connection.dbname, "fill_me_in");
        assert_eq!(config.connection.host, "localhost");
    }

    #[test]
    fn test_generated_config_placeholder_api_key() {
        let contents = default_config(None);
        assert!(contents.contains("api_key = \"fill_me_in\""));
        assert!(contents.contains("#db_port = 5432"));
    }

    #[test]
    fn test_write_default_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_private(dir.path(), "existing.conf", "keep me");

        let err = write_default(&path, None).unwrap_err();
        assert!(matches!(err, ConfigError::Write { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn test_resolve_psql_prefers_configured_binary() {
        let config = parse(
            "api_key = \"a\"\ndb_name = \"b\"\npsql_binary = \"/opt/pg/bin/psql\"\n",
            Path::new("c.conf"),
            None,
        )
        .unwrap();
        assert_eq!(
            config.resolve_psql(OsStr::new("")).unwrap(),
            PathBuf::from("/opt/pg/bin/psql")
        );
    }

    #[test]
    fn test_resolve_psql_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse("api_key = \"a\"\ndb_name = \"b\"\n", Path::new("c.conf"), None).unwrap();
        let err = config.resolve_psql(dir.path().as_os_str()).unwrap_err();
        assert!(matches!(err, ConfigError::PsqlNotFound));
    }
}

mod collector;
mod config;
mod executor;
mod postgres_info;
mod preflight;
mod stats;
mod submit;
mod system_info;

use clap::Parser;
use collector::{CollectorError, Outcome, RunOptions};
use config::CollectorConfig;
use executor::psql::PsqlExecutor;
use std::path::PathBuf;
use std::process::ExitCode;
use submit::Submitter;

/// Collects query statistics from PostgreSQL (via pg_stat_plans) and
/// submits them to pganalyze.
#[derive(Parser, Debug)]
#[command(name = "pganalyze-collector", version, about)]
pub struct Cli {
    /// Print verbose debug information
    #[arg(short, long)]
    verbose: bool,

    /// Alternative config file path
    /// (defaults: $HOME/.pganalyze_collector.conf, /etc/pganalyze/collector.conf)
    #[arg(long, value_name = "CONFIGFILE")]
    config: Option<PathBuf>,

    /// Write a default config file to the first config path and exit
    #[arg(long)]
    generate_config: bool,

    /// API key to use (overrides the config file; filled in by --generate-config)
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Suppress all non-warning output during normal operation
    #[arg(short, long, visible_alias = "cron")]
    quiet: bool,

    /// Print the data that would be posted instead of posting it
    #[arg(short, long)]
    dry_run: bool,

    /// Don't reset statistics after a successful submission
    #[arg(short = 'n', long)]
    no_reset: bool,

    /// Don't send example queries, which may contain literal values
    #[arg(long)]
    no_query_parameters: bool,

    /// Don't collect OS level performance data
    #[arg(long)]
    no_system_information: bool,
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("pganalyze_collector={level}"))
            }),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Executor for the configured server, with the session settings the
/// statistics query relies on.
fn build_executor(config: &CollectorConfig, psql: PathBuf) -> PsqlExecutor {
    let (name, value) = stats::EXPLAIN_FORMAT_SETTING;
    PsqlExecutor::new(psql, config.connection.clone(), config.query_timeout)
        .with_setting(name, value)
}

async fn run(cli: Cli) -> Result<(), CollectorError> {
    let candidates = match &cli.config {
        Some(path) => vec![path.clone()],
        None => config::default_candidates(),
    };

    if cli.generate_config {
        let path = candidates
            .first()
            .ok_or_else(|| config::ConfigError::NotFound { candidates: Vec::new() })?;
        config::write_default(path, cli.api_key.as_deref())?;
        tracing::info!(
            path = %path.display(),
            "wrote standard configuration, please edit it and then run the collector again"
        );
        return Ok(());
    }

    let path = config::locate(&candidates)?;
    let config = config::load(&path, cli.api_key.as_deref())?;
    let psql = config.resolve_psql(&std::env::var_os("PATH").unwrap_or_default())?;
    tracing::debug!(
        psql = %psql.display(),
        connection = ?config.connection,
        "configuration resolved"
    );

    let executor = build_executor(&config, psql);
    let submitter = Submitter::new(config.api_url.clone())?;
    let options = RunOptions {
        api_key: config.api_key.clone(),
        dry_run: cli.dry_run,
        reset: !cli.no_reset,
        query_parameters: !cli.no_query_parameters,
        system: (!cli.no_system_information).then(system_info::Host::default),
    };

    match collector::run(&executor, &submitter, &options).await? {
        Outcome::DryRun(payload) => println!("{payload}"),
        Outcome::Submitted { queries, reset } => {
            tracing::debug!(queries, reset, "run complete");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["pganalyze-collector"]).unwrap();
        assert!(!cli.verbose);
        assert!(!cli.quiet);
        assert!(!cli.dry_run);
        assert!(!cli.no_reset);
        assert!(!cli.no_query_parameters);
        assert!(!cli.no_system_information);
        assert!(!cli.generate_config);
        assert_eq!(cli.config, None);
        assert_eq!(cli.api_key, None);
    }

    #[test]
    fn test_cli_cron_is_alias_for_quiet() {
        let cli = Cli::try_parse_from(["pganalyze-collector", "--cron"]).unwrap();
        assert!(cli.quiet);
        let cli = Cli::try_parse_from(["pganalyze-collector", "-q"]).unwrap();
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "pganalyze-collector",
            "-v",
            "--config",
            "/tmp/collector.conf",
            "-d",
            "-n",
            "--no-query-parameters",
            "--no-system-information",
            "--api-key",
            "abc",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/collector.conf")));
        assert!(cli.dry_run);
        assert!(cli.no_reset);
        assert!(cli.no_query_parameters);
        assert!(cli.no_system_information);
        assert_eq!(cli.api_key.as_deref(), Some("abc"));
    }

    #[test]
    fn test_executor_sets_explain_format_for_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.conf");
        std::fs::write(&path, "db_name = \"app\"\napi_key = \"k\"\n").unwrap();
        let config = config::load(&path, None).unwrap();

        let executor = build_executor(&config, PathBuf::from("/usr/bin/psql"));
        assert_eq!(
            executor.pgoptions().as_deref(),
            Some("-c pg_stat_plans.explain_format=json")
        );
    }

    #[test]
    fn test_cli_version_flag() {
        let err = Cli::try_parse_from(["pganalyze-collector", "-V"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[tokio::test]
    async fn test_generate_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.conf");
        let cli = Cli::try_parse_from([
            "pganalyze-collector",
            "--generate-config",
            "--config",
            path.to_str().unwrap(),
            "--api-key",
            "generated-key",
        ])
        .unwrap();

        run(cli).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("api_key = \"generated-key\""));
    }

    #[tokio::test]
    async fn test_missing_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.conf");
        let cli = Cli::try_parse_from([
            "pganalyze-collector",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();

        let err = run(cli).await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::Config(config::ConfigError::NotFound { .. })
        ));
    }
}

/// One collection run: preflight, fetch, submit, then reset the server's
/// statistics once the endpoint has accepted them.
use crate::config::ConfigError;
use crate::executor::{OnError, QueryError, QueryExecutor};
use crate::postgres_info;
use crate::preflight::{self, ValidationError};
use crate::stats::{self, RESET_QUERY};
use crate::submit::{Data, SubmissionError, Submission, Submitter};
use crate::system_info::{self, Host};

/// Per-run switches taken from the command line and config.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub api_key: String,
    /// Print the payload instead of posting it.
    pub dry_run: bool,
    /// Reset statistics after a successful submission.
    pub reset: bool,
    /// Include example query text (plans and backends).
    pub query_parameters: bool,
    /// Host to read system information from; `None` leaves the section out.
    pub system: Option<Host>,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Submitted { queries: usize, reset: bool },
    /// Rendered payload that would have been posted.
    DryRun(String),
}

/// Any error that ends a run.
#[derive(Debug)]
pub enum CollectorError {
    Config(ConfigError),
    Validation(ValidationError),
    Query(QueryError),
    Submission(SubmissionError),
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Config(e) => write!(f, "configuration error: {e}"),
            CollectorError::Validation(e) => write!(f, "preflight check failed: {e}"),
            CollectorError::Query(e) => write!(f, "{e}"),
            CollectorError::Submission(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::Config(e) => Some(e),
            CollectorError::Validation(e) => Some(e),
            CollectorError::Query(e) => Some(e),
            CollectorError::Submission(e) => Some(e),
        }
    }
}

impl From<ConfigError> for CollectorError {
    fn from(e: ConfigError) -> Self {
        CollectorError::Config(e)
    }
}

impl From<ValidationError> for CollectorError {
    fn from(e: ValidationError) -> Self {
        CollectorError::Validation(e)
    }
}

impl From<QueryError> for CollectorError {
    fn from(e: QueryError) -> Self {
        CollectorError::Query(e)
    }
}

impl From<SubmissionError> for CollectorError {
    fn from(e: SubmissionError) -> Self {
        CollectorError::Submission(e)
    }
}

/// Run the pipeline once.
///
/// The reset statement is only issued after the endpoint answered 200; a
/// dry run or any failure leaves the server's statistics untouched.
pub async fn run<E: QueryExecutor>(
    executor: &E,
    submitter: &Submitter,
    options: &RunOptions,
) -> Result<Outcome, CollectorError> {
    let server_version = preflight::validate(executor).await?;

    let records = stats::fetch_query_records(executor, options.query_parameters).await?;
    tracing::debug!(queries = records.len(), "fetched query statistics");

    let system = match &options.system {
        Some(host) => Some(system_info::collect_system_info(host, executor).await),
        None => None,
    };
    let postgres =
        postgres_info::fetch_postgres_info(executor, server_version, options.query_parameters)
            .await?;

    let collected_at = chrono::Utc::now().timestamp();
    let data = Data {
        queries: &records,
        system: system.as_ref(),
        postgres: &postgres,
    };
    let submission = Submission::new(
        &data,
        &options.api_key,
        collected_at,
        options.query_parameters,
    )?;

    if options.dry_run {
        tracing::info!("dry run, dumping data that would get posted");
        return Ok(Outcome::DryRun(submission.render()?));
    }

    submitter.submit(&submission).await?;
    tracing::info!(
        endpoint = submitter.endpoint(),
        queries = records.len(),
        "submitted successfully"
    );

    if options.reset {
        tracing::debug!("resetting stats");
        executor.execute(RESET_QUERY, OnError::Halt).await?;
    }

    Ok(Outcome::Submitted {
        queries: records.len(),
        reset: options.reset,
    })
}

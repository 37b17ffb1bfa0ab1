/// Submission of aggregated query records to the collection endpoint as a
/// single form-encoded POST.
use crate::postgres_info::PostgresInfo;
use crate::stats::QueryRecord;
use crate::system_info::SystemInfo;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Default collection endpoint.
pub const DEFAULT_API_URL: &str = "http://pganalyze.com/queries";

/// Where the query statistics come from, sent as `query_source`.
pub const QUERY_SOURCE: &str = "pg_stat_plans";

/// Identifies this program in the `submitter` form field.
pub const SUBMITTER: &str = concat!("pganalyze-collector ", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while building or sending a submission.
#[derive(Debug)]
pub enum SubmissionError {
    /// The records could not be serialized.
    Serialize { source: serde_json::Error },
    /// The HTTP client could not be constructed.
    Client { source: reqwest::Error },
    /// The request did not complete.
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },
    /// The endpoint answered with something other than 200.
    Rejected { status: u16, body: String },
}

impl std::fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionError::Serialize { source } => {
                write!(f, "failed to serialize query data: {source}")
            }
            SubmissionError::Client { source } => {
                write!(f, "failed to build HTTP client: {source}")
            }
            SubmissionError::Transport { endpoint, source } => {
                write!(f, "failed to post data to {endpoint}: {source}")
            }
            SubmissionError::Rejected { status, body } => {
                write!(f, "rejected by server (HTTP {status})")?;
                let body = body.trim();
                if !body.is_empty() {
                    write!(f, ": {body}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for SubmissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmissionError::Serialize { source } => Some(source),
            SubmissionError::Client { source } => Some(source),
            SubmissionError::Transport { source, .. } => Some(source),
            SubmissionError::Rejected { .. } => None,
        }
    }
}

impl From<serde_json::Error> for SubmissionError {
    fn from(e: serde_json::Error) -> Self {
        SubmissionError::Serialize { source: e }
    }
}

/// Everything collected in one run; serialized into the `data` field.
#[derive(Debug, Serialize)]
pub struct Data<'a> {
    pub queries: &'a [QueryRecord],
    /// Absent when system information is switched off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a SystemInfo>,
    pub postgres: &'a PostgresInfo,
}

/// Form fields of one submission, in the order they are sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub data: String,
    pub api_key: String,
    pub collected_at: i64,
    pub query_parameters: bool,
    pub system_information: bool,
}

impl Submission {
    /// Serialize the collected sections into the `data` field.
    pub fn new(
        data: &Data<'_>,
        api_key: &str,
        collected_at: i64,
        query_parameters: bool,
    ) -> Result<Self, SubmissionError> {
        Ok(Self {
            data: serde_json::to_string(data)?,
            api_key: api_key.to_string(),
            collected_at,
            query_parameters,
            system_information: data.system.is_some(),
        })
    }

    fn form(&self) -> [(&'static str, String); 7] {
        [
            ("data", self.data.clone()),
            ("api_key", self.api_key.clone()),
            ("collected_at", self.collected_at.to_string()),
            ("submitter", SUBMITTER.to_string()),
            ("query_parameters", self.query_parameters.to_string()),
            ("system_information", self.system_information.to_string()),
            ("query_source", QUERY_SOURCE.to_string()),
        ]
    }

    /// Pretty JSON of what would be posted. Each plan's `explain` text is
    /// expanded into JSON when it parses as such.
    pub fn render(&self) -> Result<String, SubmissionError> {
        let mut data: Value = serde_json::from_str(&self.data)?;
        if let Some(queries) = data.get_mut("queries").and_then(Value::as_array_mut) {
            for plan in queries
                .iter_mut()
                .filter_map(|q| q.get_mut("plans").and_then(Value::as_array_mut))
                .flatten()
            {
                let parsed = plan
                    .get("explain")
                    .and_then(Value::as_str)
                    .and_then(|text| serde_json::from_str::<Value>(text).ok());
                if let Some(explain) = parsed {
                    plan["explain"] = explain;
                }
            }
        }

        let payload = serde_json::json!({
            "data": data,
            "api_key": self.api_key,
            "collected_at": self.collected_at,
            "submitter": SUBMITTER,
            "query_parameters": self.query_parameters,
            "system_information": self.system_information,
            "query_source": QUERY_SOURCE,
        });
        Ok(serde_json::to_string_pretty(&payload)?)
    }
}

/// Posts submissions to one endpoint. Exactly one attempt per call.
pub struct Submitter {
    client: reqwest::Client,
    endpoint: String,
}

impl Submitter {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SubmissionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SubmissionError::Client { source: e })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send the submission. Only HTTP 200 counts as accepted.
    pub async fn submit(&self, submission: &Submission) -> Result<(), SubmissionError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            bytes = submission.data.len(),
            "posting query data"
        );
        let response = self
            .client
            .post(&self.endpoint)
            .form(&submission.form())
            .send()
            .await
            .map_err(|e| SubmissionError::Transport {
                endpoint: self.endpoint.clone(),
                source: e,
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

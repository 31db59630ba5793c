// dbt Cloud job adapter and API v2 client

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::clients::read_json;
use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;

const OPERATION: &str = "dbt Cloud job run";

/// dbt Cloud run status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbtRunStatus {
    Queued,
    Starting,
    Running,
    Success,
    Error,
    Cancelled,
}

impl DbtRunStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DbtRunStatus::Queued),
            2 => Some(DbtRunStatus::Starting),
            3 => Some(DbtRunStatus::Running),
            10 => Some(DbtRunStatus::Success),
            20 => Some(DbtRunStatus::Error),
            30 => Some(DbtRunStatus::Cancelled),
            _ => None,
        }
    }
}

/// Run details returned by dbt Cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbtRun {
    pub status: DbtRunStatus,
    pub status_humanized: String,
    pub status_message: Option<String>,
}

#[async_trait]
pub trait DbtClient: Send + Sync {
    async fn trigger_job_run(&self, job_id: i64, cause: &str) -> Result<i64, ExecutionError>;

    async fn get_run(&self, run_id: i64) -> Result<DbtRun, ExecutionError>;

    async fn cancel_run(&self, run_id: i64) -> Result<(), ExecutionError>;
}

/// dbt Cloud API v2 client authenticated with a service token
pub struct HttpDbtClient {
    http: reqwest::Client,
    base_url: String,
    account_id: i64,
    token: String,
}

impl HttpDbtClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        account_id: i64,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account_id,
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v2/accounts/{}/{}",
            self.base_url, self.account_id, path
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Token {}", self.token))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct RunData {
    id: i64,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    status_humanized: String,
    #[serde(default)]
    status_message: Option<String>,
}

#[async_trait]
impl DbtClient for HttpDbtClient {
    #[tracing::instrument(skip(self))]
    async fn trigger_job_run(&self, job_id: i64, cause: &str) -> Result<i64, ExecutionError> {
        let response = self
            .authorize(self.http.post(self.url(&format!("jobs/{}/run/", job_id))))
            .json(&json!({ "cause": cause }))
            .send()
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        let run: Envelope<RunData> = read_json(response)
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        Ok(run.data.id)
    }

    #[tracing::instrument(skip(self))]
    async fn get_run(&self, run_id: i64) -> Result<DbtRun, ExecutionError> {
        let response = self
            .authorize(self.http.get(self.url(&format!("runs/{}/", run_id))))
            .send()
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        let run: Envelope<RunData> = read_json(response)
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        let status = DbtRunStatus::from_code(run.data.status).ok_or_else(|| {
            ExecutionError::status_failed(
                OPERATION,
                format!("unknown run status code {}", run.data.status),
            )
        })?;
        Ok(DbtRun {
            status,
            status_humanized: run.data.status_humanized,
            status_message: run.data.status_message,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_run(&self, run_id: i64) -> Result<(), ExecutionError> {
        let response = self
            .authorize(self.http.post(self.url(&format!("runs/{}/cancel/", run_id))))
            .send()
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        read_json::<serde_json::Value>(response)
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        Ok(())
    }
}

/// A dbt Cloud job run started by a step
pub struct DbtJobRun {
    client: Arc<dyn DbtClient>,
    job_id: i64,
    cause: String,
}

impl DbtJobRun {
    pub fn new(client: Arc<dyn DbtClient>, job_id: i64, step_name: &str) -> Self {
        Self {
            client,
            job_id,
            cause: format!("Triggered by step {}", step_name),
        }
    }
}

fn parse_run_id(run_id: &str) -> Result<i64, String> {
    run_id
        .parse::<i64>()
        .map_err(|e| format!("invalid run id '{}': {}", run_id, e))
}

#[async_trait]
impl RemoteOperation for DbtJobRun {
    type Status = DbtRun;

    fn name(&self) -> String {
        OPERATION.to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self.client.trigger_job_run(self.job_id, &self.cause).await?;
        Ok(StartOutcome::Started {
            run_id: run_id.to_string(),
        })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        let id = parse_run_id(run_id).map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        self.client.get_run(id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        let id = parse_run_id(run_id).map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        self.client.cancel_run(id).await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        matches!(
            status.status,
            DbtRunStatus::Success | DbtRunStatus::Error | DbtRunStatus::Cancelled
        )
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == DbtRunStatus::Success
    }

    fn describe(&self, status: &Self::Status) -> String {
        match &status.status_message {
            Some(message) => format!(
                "dbt Cloud job run finished with status {}: {}",
                status.status_humanized, message
            ),
            None => format!(
                "dbt Cloud job run finished with status {}",
                status.status_humanized
            ),
        }
    }
}

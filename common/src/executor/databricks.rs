// Databricks job run adapter and Jobs API client

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::clients::read_json;
use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;

const OPERATION: &str = "Databricks job run";

/// State of a Databricks job run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabricksRunState {
    pub life_cycle_state: String,
    #[serde(default)]
    pub result_state: Option<String>,
    #[serde(default)]
    pub state_message: Option<String>,
}

impl DatabricksRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.life_cycle_state.as_str(),
            "TERMINATED" | "SKIPPED" | "INTERNAL_ERROR"
        )
    }

    pub fn is_success(&self) -> bool {
        self.result_state.as_deref() == Some("SUCCESS")
    }
}

/// Databricks Jobs API
#[async_trait]
pub trait DatabricksClient: Send + Sync {
    async fn run_now(
        &self,
        job_id: i64,
        parameters: &HashMap<String, String>,
    ) -> Result<i64, ExecutionError>;

    async fn get_run_state(&self, run_id: i64) -> Result<DatabricksRunState, ExecutionError>;

    async fn cancel_run(&self, run_id: i64) -> Result<(), ExecutionError>;
}

/// Jobs API 2.1 client authenticated with a personal access token
pub struct HttpDatabricksClient {
    http: reqwest::Client,
    host: String,
    token: String,
}

impl HttpDatabricksClient {
    pub fn new(http: reqwest::Client, host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/2.1/jobs/{}", self.host, path)
    }
}

#[derive(Deserialize)]
struct RunNowResponse {
    run_id: i64,
}

#[derive(Deserialize)]
struct GetRunResponse {
    state: DatabricksRunState,
}

#[async_trait]
impl DatabricksClient for HttpDatabricksClient {
    #[tracing::instrument(skip(self, parameters))]
    async fn run_now(
        &self,
        job_id: i64,
        parameters: &HashMap<String, String>,
    ) -> Result<i64, ExecutionError> {
        let mut body = json!({ "job_id": job_id });
        if !parameters.is_empty() {
            body["job_parameters"] = json!(parameters);
        }
        let response = self
            .http
            .post(self.url("run-now"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        let run: RunNowResponse = read_json(response)
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        Ok(run.run_id)
    }

    #[tracing::instrument(skip(self))]
    async fn get_run_state(&self, run_id: i64) -> Result<DatabricksRunState, ExecutionError> {
        let response = self
            .http
            .get(self.url("runs/get"))
            .bearer_auth(&self.token)
            .query(&[("run_id", run_id)])
            .send()
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        let run: GetRunResponse = read_json(response)
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        Ok(run.state)
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_run(&self, run_id: i64) -> Result<(), ExecutionError> {
        let response = self
            .http
            .post(self.url("runs/cancel"))
            .bearer_auth(&self.token)
            .json(&json!({ "run_id": run_id }))
            .send()
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        read_json::<serde_json::Value>(response)
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        Ok(())
    }
}

/// A Databricks job run started by a step
pub struct DatabricksJobRun {
    client: Arc<dyn DatabricksClient>,
    job_id: i64,
    parameters: HashMap<String, String>,
}

impl DatabricksJobRun {
    pub fn new(
        client: Arc<dyn DatabricksClient>,
        job_id: i64,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            client,
            job_id,
            parameters,
        }
    }
}

fn parse_run_id(run_id: &str) -> Result<i64, String> {
    run_id
        .parse::<i64>()
        .map_err(|e| format!("invalid run id '{}': {}", run_id, e))
}

#[async_trait]
impl RemoteOperation for DatabricksJobRun {
    type Status = DatabricksRunState;

    fn name(&self) -> String {
        OPERATION.to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self.client.run_now(self.job_id, &self.parameters).await?;
        Ok(StartOutcome::Started {
            run_id: run_id.to_string(),
        })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        let run_id = parse_run_id(run_id).map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        self.client.get_run_state(run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        let run_id = parse_run_id(run_id).map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        self.client.cancel_run(run_id).await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        status.is_terminal()
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.is_success()
    }

    fn describe(&self, status: &Self::Status) -> String {
        format!(
            "Databricks job run finished with state {} / {}: {}",
            status.life_cycle_state,
            status.result_state.as_deref().unwrap_or("NONE"),
            status.state_message.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_terminal_states() {
        let state = |life: &str, result: Option<&str>| DatabricksRunState {
            life_cycle_state: life.to_string(),
            result_state: result.map(str::to_string),
            state_message: None,
        };
        assert!(!state("RUNNING", None).is_terminal());
        assert!(!state("PENDING", None).is_terminal());
        assert!(state("TERMINATED", Some("SUCCESS")).is_success());
        assert!(state("TERMINATED", Some("FAILED")).is_terminal());
        assert!(!state("TERMINATED", Some("FAILED")).is_success());
        assert!(state("INTERNAL_ERROR", None).is_terminal());
    }

    #[tokio::test]
    async fn test_http_client_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.1/jobs/run-now"))
            .and(header("authorization", "Bearer dapi-token"))
            .and(body_partial_json(json!({ "job_id": 17, "job_parameters": { "Day": "1" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "run_id": 900 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/2.1/jobs/runs/get"))
            .and(query_param("run_id", "900"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": { "life_cycle_state": "TERMINATED", "result_state": "SUCCESS" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/2.1/jobs/runs/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDatabricksClient::new(reqwest::Client::new(), server.uri(), "dapi-token");
        let parameters = HashMap::from([("Day".to_string(), "1".to_string())]);
        let run_id = client.run_now(17, &parameters).await.unwrap();
        assert_eq!(run_id, 900);
        assert!(client.get_run_state(run_id).await.unwrap().is_success());
        client.cancel_run(run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_is_start_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.1/jobs/run-now"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = HttpDatabricksClient::new(reqwest::Client::new(), server.uri(), "bad");
        let err = client.run_now(1, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::RemoteStartFailed { .. }));
        assert!(err.to_string().contains("403"));
    }
}

// Serverless function adapter: plain functions complete on the start call,
// durable functions are polled through their status endpoint.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;

use super::clients::read_json;
use super::http::to_method;
use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;
use crate::models::FunctionStepConfig;

const OPERATION: &str = "function";
const FUNCTION_KEY_HEADER: &str = "x-functions-key";

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionStatus {
    /// Response of a function that finished within the start call
    Response { status: u16, body: String },
    /// Runtime status of a durable orchestration
    Orchestration {
        runtime_status: String,
        output: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DurableEndpoints {
    id: String,
    status_query_get_uri: String,
    #[serde(default)]
    terminate_post_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrchestrationState {
    runtime_status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
}

pub struct FunctionCall {
    client: Client,
    config: FunctionStepConfig,
    endpoints: Mutex<Option<DurableEndpoints>>,
}

impl FunctionCall {
    /// `config` must already carry substituted parameters
    pub fn new(client: Client, config: FunctionStepConfig) -> Self {
        Self {
            client,
            config,
            endpoints: Mutex::new(None),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.function_key {
            Some(key) => request.header(FUNCTION_KEY_HEADER, key),
            None => request,
        }
    }

    fn endpoints(&self) -> Option<DurableEndpoints> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl RemoteOperation for FunctionCall {
    type Status = FunctionStatus;

    fn name(&self) -> String {
        OPERATION.to_string()
    }

    fn validate(&self) -> Result<(), ExecutionError> {
        reqwest::Url::parse(&self.config.url).map_err(|e| {
            ExecutionError::InvalidStepConfiguration(format!(
                "Invalid function url '{}': {}",
                self.config.url, e
            ))
        })?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(url = %self.config.url))]
    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let mut request = self
            .authorize(self.client.request(to_method(self.config.method), &self.config.url));
        if let Some(body) = &self.config.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;

        if self.config.durable && (200..300).contains(&status) {
            if let Ok(endpoints) = serde_json::from_str::<DurableEndpoints>(&body) {
                let run_id = endpoints.id.clone();
                *self.endpoints.lock() = Some(endpoints);
                return Ok(StartOutcome::Started { run_id });
            }
        }
        Ok(StartOutcome::Completed(FunctionStatus::Response { status, body }))
    }

    async fn status(&self, _run_id: &str) -> Result<Self::Status, ExecutionError> {
        let endpoints = self.endpoints().ok_or_else(|| {
            ExecutionError::status_failed(OPERATION, "no status endpoint was returned")
        })?;
        let response = self
            .authorize(self.client.get(&endpoints.status_query_get_uri))
            .send()
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        let state: OrchestrationState = read_json(response)
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        Ok(FunctionStatus::Orchestration {
            runtime_status: state.runtime_status,
            output: state.output,
        })
    }

    async fn cancel(&self, _run_id: &str) -> Result<(), ExecutionError> {
        let uri = self
            .endpoints()
            .and_then(|e| e.terminate_post_uri)
            .ok_or_else(|| ExecutionError::cancel_failed(OPERATION, "no terminate endpoint"))?;
        let uri = uri.replace("{text}", "Cancelled by step execution");
        let response = self
            .authorize(self.client.post(&uri))
            .send()
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        read_json::<serde_json::Value>(response)
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        Ok(())
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        match status {
            FunctionStatus::Response { .. } => true,
            FunctionStatus::Orchestration { runtime_status, .. } => matches!(
                runtime_status.as_str(),
                "Completed" | "Failed" | "Canceled" | "Terminated"
            ),
        }
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        match status {
            FunctionStatus::Response { status, .. } => (200..300).contains(status),
            FunctionStatus::Orchestration { runtime_status, .. } => runtime_status == "Completed",
        }
    }

    fn describe(&self, status: &Self::Status) -> String {
        match status {
            FunctionStatus::Response { status, body } => {
                format!("Function returned status {}\n{}", status, body)
            }
            FunctionStatus::Orchestration {
                runtime_status,
                output: Some(output),
            } => format!("Function orchestration {}\n{}", runtime_status, output),
            FunctionStatus::Orchestration { runtime_status, .. } => {
                format!("Function orchestration {}", runtime_status)
            }
        }
    }
}

// HTTP trigger executor: one request, 2xx is success

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use std::sync::Arc;
use std::time::Duration;

use super::attempt::AttemptRecorder;
use super::poll::classify_interruption;
use super::StepExecutor;
use crate::cancellation::{CancelSignal, CombinedCancellation};
use crate::errors::ExecutionError;
use crate::models::{HttpAuth, HttpMethod, HttpStepConfig, OrchestrationContext, StepOutcome};
use crate::parameters::ParameterSubstitutor;

const OPERATION: &str = "HTTP request";

pub(crate) fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn apply_auth(request: RequestBuilder, auth: &Option<HttpAuth>) -> RequestBuilder {
    match auth {
        Some(HttpAuth::Basic { username, password }) => {
            tracing::debug!("Applying Basic authentication for user: {}", username);
            request.basic_auth(username, Some(password))
        }
        Some(HttpAuth::Bearer { token }) => request.bearer_auth(token),
        None => request,
    }
}

/// Substitute step parameters into every text field of the request
pub fn resolve_request(
    config: &HttpStepConfig,
    parameters: &ParameterSubstitutor,
) -> Result<HttpStepConfig, ExecutionError> {
    let mut headers = std::collections::HashMap::with_capacity(config.headers.len());
    for (key, value) in &config.headers {
        headers.insert(parameters.substitute(key)?, parameters.substitute(value)?);
    }
    let auth = match &config.auth {
        Some(HttpAuth::Basic { username, password }) => Some(HttpAuth::Basic {
            username: parameters.substitute(username)?,
            password: parameters.substitute(password)?,
        }),
        Some(HttpAuth::Bearer { token }) => Some(HttpAuth::Bearer {
            token: parameters.substitute(token)?,
        }),
        None => None,
    };
    Ok(HttpStepConfig {
        method: config.method,
        url: parameters.substitute(&config.url)?,
        headers,
        body: parameters.substitute_opt(config.body.as_deref())?,
        auth,
    })
}

/// HttpTriggerExecutor sends a single request with parameters already resolved
pub struct HttpTriggerExecutor {
    client: Client,
    request: HttpStepConfig,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
}

impl HttpTriggerExecutor {
    pub fn new(
        client: Client,
        request: HttpStepConfig,
        recorder: Arc<AttemptRecorder>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            request,
            recorder,
            timeout,
        }
    }

    #[tracing::instrument(skip(self), fields(url = %self.request.url))]
    async fn send(&self) -> Result<(u16, String), ExecutionError> {
        let method = to_method(self.request.method);
        tracing::info!("Executing HTTP {} request to: {}", method, self.request.url);

        let mut request = self.client.request(method, &self.request.url);
        for (key, value) in &self.request.headers {
            request = request.header(key, value);
        }
        request = apply_auth(request, &self.request.auth);
        if let Some(body) = &self.request.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecutionError::HttpRequestFailed(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ExecutionError::HttpRequestFailed(format!("Failed to read response body: {}", e))
        })?;
        tracing::info!("HTTP response status: {}", status);

        if !status.is_success() {
            return Err(ExecutionError::HttpRequestFailed(format!(
                "HTTP request failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok((status.as_u16(), body))
    }
}

#[async_trait]
impl StepExecutor for HttpTriggerExecutor {
    async fn execute(&self, _ctx: &OrchestrationContext, cancel: &CancelSignal) -> StepOutcome {
        // Nothing remote exists before the request is sent, so the timeout
        // covers the request itself.
        let combined = CombinedCancellation::start(cancel, self.timeout);

        let sent = tokio::select! {
            biased;
            _ = combined.cancelled() => {
                return classify_interruption(&self.recorder, &combined, OPERATION).await;
            }
            sent = self.send() => sent,
        };

        match sent {
            Ok((status, body)) if body.is_empty() => {
                self.recorder
                    .add_info(format!("HTTP request returned status {}", status))
                    .await;
                StepOutcome::Success
            }
            Ok((status, body)) => {
                self.recorder
                    .add_info(format!("HTTP request returned status {}\n{}", status, body))
                    .await;
                StepOutcome::Success
            }
            Err(e) => {
                self.recorder.add_error(e.to_string()).await;
                StepOutcome::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        HttpStepConfig, MessageKind, StepConfig, StepExecution, StepExecutionAttempt,
        StepParameter,
    };
    use crate::storage::{AttemptStore, MemoryAttemptStore};
    use uuid::Uuid;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recorder(config: &HttpStepConfig) -> Arc<AttemptRecorder> {
        let step = StepExecution {
            execution_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            step_name: "notify".to_string(),
            timeout_minutes: 0.0,
            retry_attempts: 0,
            retry_interval_minutes: 0.0,
            parameters: Vec::new(),
            config: StepConfig::HttpTrigger(config.clone()),
        };
        let store: Arc<dyn AttemptStore> = Arc::new(MemoryAttemptStore::new());
        Arc::new(AttemptRecorder::new(StepExecutionAttempt::new(&step, 0), store))
    }

    fn config(url: String) -> HttpStepConfig {
        HttpStepConfig {
            method: HttpMethod::Post,
            url,
            headers: [("X-Load-Date".to_string(), "${LoadDate}".to_string())].into(),
            body: Some(r#"{"date":"${LoadDate}"}"#.to_string()),
            auth: Some(HttpAuth::Bearer {
                token: "secret".to_string(),
            }),
        }
    }

    #[test]
    fn test_resolve_request_substitutes_all_fields() {
        let parameters = ParameterSubstitutor::new(&[StepParameter {
            name: "LoadDate".to_string(),
            value: serde_json::json!("2024-01-31"),
        }])
        .unwrap();
        let resolved = resolve_request(&config("http://h/${LoadDate}".to_string()), &parameters)
            .unwrap();
        assert_eq!(resolved.url, "http://h/2024-01-31");
        assert_eq!(resolved.headers["X-Load-Date"], "2024-01-31");
        assert_eq!(resolved.body.as_deref(), Some(r#"{"date":"2024-01-31"}"#));
    }

    #[test]
    fn test_resolve_request_rejects_undefined_parameter() {
        let parameters = ParameterSubstitutor::new(&[]).unwrap();
        let err = resolve_request(&config("http://h".to_string()), &parameters).unwrap_err();
        assert!(matches!(err, ExecutionError::ParameterResolutionFailed(_)));
    }

    #[tokio::test]
    async fn test_successful_request_records_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer secret"))
            .and(body_string(r#"{"date":"2024-01-31"}"#))
            .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
            .expect(1)
            .mount(&server)
            .await;

        let parameters = ParameterSubstitutor::new(&[StepParameter {
            name: "LoadDate".to_string(),
            value: serde_json::json!("2024-01-31"),
        }])
        .unwrap();
        let request =
            resolve_request(&config(format!("{}/hook", server.uri())), &parameters).unwrap();
        let recorder = recorder(&request);
        let executor = HttpTriggerExecutor::new(Client::new(), request, recorder.clone(), None);

        let outcome = executor
            .execute(&OrchestrationContext::root(Uuid::new_v4()), &CancelSignal::new())
            .await;

        assert_eq!(outcome, StepOutcome::Success);
        assert!(recorder
            .snapshot()
            .has_message_containing(MessageKind::Info, "queued"));
    }

    #[tokio::test]
    async fn test_error_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let request = HttpStepConfig {
            method: HttpMethod::Post,
            url: server.uri(),
            headers: Default::default(),
            body: None,
            auth: None,
        };
        let recorder = recorder(&request);
        let executor = HttpTriggerExecutor::new(Client::new(), request, recorder.clone(), None);

        let outcome = executor
            .execute(&OrchestrationContext::root(Uuid::new_v4()), &CancelSignal::new())
            .await;

        assert_eq!(outcome, StepOutcome::Failure);
        assert!(recorder
            .snapshot()
            .has_message_containing(MessageKind::Error, "status 500: boom"));
    }

    #[tokio::test]
    async fn test_caller_cancel_during_request_is_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let request = HttpStepConfig {
            method: HttpMethod::Get,
            url: server.uri(),
            headers: Default::default(),
            body: None,
            auth: None,
        };
        let recorder = recorder(&request);
        let executor = HttpTriggerExecutor::new(Client::new(), request, recorder.clone(), None);
        let cancel = CancelSignal::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel_by("operator");
        });

        let outcome = executor
            .execute(&OrchestrationContext::root(Uuid::new_v4()), &cancel)
            .await;

        assert_eq!(outcome, StepOutcome::Cancel);
        assert!(recorder
            .snapshot()
            .has_message_containing(MessageKind::Warning, "cancelled by operator"));
    }
}

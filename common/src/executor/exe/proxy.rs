// Executable steps delegated to a remote execution proxy

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{ExeTaskStatus, StartExeRequest, StartExeResponse};
use crate::cancellation::CancelSignal;
use crate::errors::ExecutionError;
use crate::executor::attempt::AttemptRecorder;
use crate::executor::clients::read_json;
use crate::executor::poll::{run_until_terminal, PollSettings, RemoteOperation, StartOutcome};
use crate::executor::StepExecutor;
use crate::models::{ExeProxy, ExternalId, MessageKind, OrchestrationContext, StepOutcome};
use crate::output::{PeriodicPublisher, PublishSchedule, SnapshotWriter};

const OPERATION: &str = "remote process";
const API_KEY_HEADER: &str = "x-api-key";

/// HTTP client of one execution proxy
#[derive(Clone)]
pub struct ExeProxyClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ExeProxyClient {
    pub fn new(http: Client, proxy: &ExeProxy) -> Self {
        Self {
            http,
            base_url: proxy.base_url.trim_end_matches('/').to_string(),
            api_key: proxy.api_key.clone(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    #[tracing::instrument(skip(self, request), fields(exe_path = %request.exe_path))]
    pub async fn start(&self, request: &StartExeRequest) -> Result<String, ExecutionError> {
        let response = self
            .authorize(self.http.post(format!("{}/exe", self.base_url)))
            .json(request)
            .send()
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        let started: StartExeResponse = read_json(response)
            .await
            .map_err(|e| ExecutionError::start_failed(OPERATION, e))?;
        Ok(started.task_id)
    }

    pub async fn status(&self, task_id: &str) -> Result<ExeTaskStatus, ExecutionError> {
        let response = self
            .authorize(self.http.get(format!("{}/exe/{}", self.base_url, task_id)))
            .send()
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))?;
        read_json(response)
            .await
            .map_err(|e| ExecutionError::status_failed(OPERATION, e))
    }

    pub async fn cancel(&self, task_id: &str) -> Result<(), ExecutionError> {
        let response = self
            .authorize(self.http.post(format!("{}/exe/{}/cancel", self.base_url, task_id)))
            .send()
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        read_json::<serde_json::Value>(response)
            .await
            .map_err(|e| ExecutionError::cancel_failed(OPERATION, e))?;
        Ok(())
    }
}

/// One proxy task seen through the poll protocol.
///
/// Every status carries the full output so far; the newest snapshot is
/// handed to latest-only publishers. A changed process id is reported back
/// to the poll loop.
struct ProxyTask<'a> {
    client: &'a ExeProxyClient,
    request: &'a StartExeRequest,
    success_exit_code: i32,
    stdout: SnapshotWriter,
    stderr: SnapshotWriter,
    process_id: Mutex<Option<u32>>,
}

#[async_trait]
impl<'a> RemoteOperation for ProxyTask<'a> {
    type Status = ExeTaskStatus;

    fn name(&self) -> String {
        OPERATION.to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self.client.start(self.request).await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        let status = self.client.status(run_id).await?;
        if let Some(output) = status.output() {
            let (stdout, stderr) = (output.output_message(), output.error_message());
            if !stdout.is_empty() {
                self.stdout.write(stdout);
            }
            if !stderr.is_empty() {
                self.stderr.write(stderr);
            }
        }
        Ok(status)
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client.cancel(run_id).await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        !matches!(status, ExeTaskStatus::Running(_))
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        matches!(status, ExeTaskStatus::Completed(c) if c.exit_code == self.success_exit_code)
    }

    fn describe(&self, status: &Self::Status) -> String {
        match status {
            ExeTaskStatus::Completed(completed) => {
                format!("Process exited with code {}", completed.exit_code)
            }
            ExeTaskStatus::Failed(failed) => format!("Process failed: {}", failed.error_message),
            ExeTaskStatus::Running(_) => "Process is running".to_string(),
        }
    }

    fn external_id(&self, run_id: &str) -> ExternalId {
        ExternalId::ProxyTask {
            task_id: run_id.to_string(),
            process_id: None,
        }
    }

    fn updated_external_id(&self, run_id: &str, status: &Self::Status) -> Option<ExternalId> {
        let process_id = status.output()?.process_id;
        let mut known = self.process_id.lock();
        if process_id.is_none() || *known == process_id {
            return None;
        }
        *known = process_id;
        Some(ExternalId::ProxyTask {
            task_id: run_id.to_string(),
            process_id,
        })
    }
}

/// Executor for exe steps that run on an execution proxy
pub struct ProxyExeExecutor {
    client: ExeProxyClient,
    request: StartExeRequest,
    success_exit_code: i32,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
    settings: PollSettings,
    schedule: PublishSchedule,
}

impl ProxyExeExecutor {
    pub fn new(
        client: ExeProxyClient,
        request: StartExeRequest,
        success_exit_code: i32,
        recorder: Arc<AttemptRecorder>,
        timeout: Option<Duration>,
        settings: PollSettings,
        schedule: PublishSchedule,
    ) -> Self {
        Self {
            client,
            request,
            success_exit_code,
            recorder,
            timeout,
            settings,
            schedule,
        }
    }
}

#[async_trait]
impl StepExecutor for ProxyExeExecutor {
    async fn execute(&self, _ctx: &OrchestrationContext, cancel: &CancelSignal) -> StepOutcome {
        let (stdout_publisher, stdout) = PeriodicPublisher::latest_only(
            "proxy-stdout",
            self.recorder.output_sink(MessageKind::Info),
            self.schedule,
        );
        let (stderr_publisher, stderr) = PeriodicPublisher::latest_only(
            "proxy-stderr",
            self.recorder.output_sink(MessageKind::Error),
            self.schedule,
        );

        let task = ProxyTask {
            client: &self.client,
            request: &self.request,
            success_exit_code: self.success_exit_code,
            stdout,
            stderr,
            process_id: Mutex::new(None),
        };
        let outcome =
            run_until_terminal(&task, &self.recorder, cancel, self.timeout, self.settings).await;

        stdout_publisher.finish().await;
        stderr_publisher.finish().await;
        outcome
    }
}

// Qlik Cloud app reload and automation run adapters

use async_trait::async_trait;
use std::sync::Arc;

use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;

/// Status of a reload or automation run, upper-cased by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QlikRunStatus {
    pub status: String,
    /// Reload log or automation error text
    pub details: Option<String>,
}

#[async_trait]
pub trait QlikClient: Send + Sync {
    async fn reload_app(&self, app_id: &str, partial: bool) -> Result<String, ExecutionError>;

    async fn get_reload(&self, reload_id: &str) -> Result<QlikRunStatus, ExecutionError>;

    async fn cancel_reload(&self, reload_id: &str) -> Result<(), ExecutionError>;

    async fn run_automation(&self, automation_id: &str) -> Result<String, ExecutionError>;

    async fn get_automation_run(
        &self,
        automation_id: &str,
        run_id: &str,
    ) -> Result<QlikRunStatus, ExecutionError>;

    async fn stop_automation_run(
        &self,
        automation_id: &str,
        run_id: &str,
    ) -> Result<(), ExecutionError>;
}

fn describe(name: &str, status: &QlikRunStatus) -> String {
    match &status.details {
        Some(details) if !details.is_empty() => {
            format!("{} finished with status {}\n{}", name, status.status, details)
        }
        _ => format!("{} finished with status {}", name, status.status),
    }
}

pub struct QlikReload {
    client: Arc<dyn QlikClient>,
    app_id: String,
    partial: bool,
}

impl QlikReload {
    pub fn new(client: Arc<dyn QlikClient>, app_id: String, partial: bool) -> Self {
        Self {
            client,
            app_id,
            partial,
        }
    }
}

#[async_trait]
impl RemoteOperation for QlikReload {
    type Status = QlikRunStatus;

    fn name(&self) -> String {
        "Qlik app reload".to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self.client.reload_app(&self.app_id, self.partial).await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        self.client.get_reload(run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client.cancel_reload(run_id).await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        matches!(
            status.status.as_str(),
            "SUCCEEDED" | "FAILED" | "CANCELED" | "EXCEEDED_LIMIT"
        )
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == "SUCCEEDED"
    }

    fn describe(&self, status: &Self::Status) -> String {
        describe(&self.name(), status)
    }
}

pub struct QlikAutomationRun {
    client: Arc<dyn QlikClient>,
    automation_id: String,
}

impl QlikAutomationRun {
    pub fn new(client: Arc<dyn QlikClient>, automation_id: String) -> Self {
        Self {
            client,
            automation_id,
        }
    }
}

#[async_trait]
impl RemoteOperation for QlikAutomationRun {
    type Status = QlikRunStatus;

    fn name(&self) -> String {
        "Qlik automation run".to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self.client.run_automation(&self.automation_id).await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        self.client
            .get_automation_run(&self.automation_id, run_id)
            .await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client
            .stop_automation_run(&self.automation_id, run_id)
            .await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        matches!(
            status.status.as_str(),
            "FINISHED" | "FAILED" | "STOPPED" | "EXCEEDED_LIMIT"
        )
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == "FINISHED"
    }

    fn describe(&self, status: &Self::Status) -> String {
        describe(&self.name(), status)
    }
}

// Data pipeline run adapter (Data Factory / Synapse style pipeline services)

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;

/// Status of one pipeline run as reported by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRunStatus {
    /// Queued, InProgress, Cancelling, Succeeded, Failed or Cancelled
    pub status: String,
    pub message: Option<String>,
}

impl PipelineRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "Succeeded" | "Failed" | "Cancelled")
    }
}

/// Pipeline service client
#[async_trait]
pub trait PipelineClient: Send + Sync {
    async fn create_run(
        &self,
        pipeline_name: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<String, ExecutionError>;

    async fn get_run(&self, run_id: &str) -> Result<PipelineRunStatus, ExecutionError>;

    async fn cancel_run(&self, run_id: &str) -> Result<(), ExecutionError>;
}

pub struct PipelineRun {
    client: Arc<dyn PipelineClient>,
    pipeline_name: String,
    parameters: HashMap<String, String>,
}

impl PipelineRun {
    pub fn new(
        client: Arc<dyn PipelineClient>,
        pipeline_name: impl Into<String>,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            client,
            pipeline_name: pipeline_name.into(),
            parameters,
        }
    }
}

#[async_trait]
impl RemoteOperation for PipelineRun {
    type Status = PipelineRunStatus;

    fn name(&self) -> String {
        format!("pipeline run of {}", self.pipeline_name)
    }

    fn validate(&self) -> Result<(), ExecutionError> {
        if self.pipeline_name.trim().is_empty() {
            return Err(ExecutionError::InvalidStepConfiguration(
                "Pipeline name is empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self
            .client
            .create_run(&self.pipeline_name, &self.parameters)
            .await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        self.client.get_run(run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client.cancel_run(run_id).await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        status.is_terminal()
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == "Succeeded"
    }

    fn describe(&self, status: &Self::Status) -> String {
        match &status.message {
            Some(message) if !message.is_empty() => {
                format!("Pipeline run finished with status {}: {}", status.status, message)
            }
            _ => format!("Pipeline run finished with status {}", status.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopClient;

    #[async_trait]
    impl PipelineClient for NoopClient {
        async fn create_run(
            &self,
            _pipeline_name: &str,
            _parameters: &HashMap<String, String>,
        ) -> Result<String, ExecutionError> {
            Ok("run".to_string())
        }

        async fn get_run(&self, _run_id: &str) -> Result<PipelineRunStatus, ExecutionError> {
            Ok(PipelineRunStatus {
                status: "InProgress".to_string(),
                message: None,
            })
        }

        async fn cancel_run(&self, _run_id: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    #[test]
    fn test_empty_pipeline_name_is_invalid() {
        let run = PipelineRun::new(Arc::new(NoopClient), " ", HashMap::new());
        assert!(run.validate().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        let run = PipelineRun::new(Arc::new(NoopClient), "load", HashMap::new());
        let status = |s: &str| PipelineRunStatus {
            status: s.to_string(),
            message: Some("Activity copy failed".to_string()),
        };
        assert!(!run.is_terminal(&status("Queued")));
        assert!(!run.is_terminal(&status("Cancelling")));
        assert!(run.is_terminal(&status("Failed")));
        assert!(run.is_success(&status("Succeeded")));
        assert!(run.describe(&status("Failed")).contains("Activity copy failed"));
    }
}

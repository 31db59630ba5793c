// Fabric item job adapter

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;

/// Job instance state reported by Fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricJobInstance {
    /// NotStarted, InProgress, Completed, Failed, Cancelled or Deduped
    pub status: String,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait FabricClient: Send + Sync {
    /// Returns the job instance id
    async fn run_item_job(
        &self,
        workspace_id: &str,
        item_id: &str,
        job_type: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<String, ExecutionError>;

    async fn get_item_job_instance(
        &self,
        workspace_id: &str,
        item_id: &str,
        instance_id: &str,
    ) -> Result<FabricJobInstance, ExecutionError>;

    async fn cancel_item_job_instance(
        &self,
        workspace_id: &str,
        item_id: &str,
        instance_id: &str,
    ) -> Result<(), ExecutionError>;
}

pub struct FabricItemJob {
    client: Arc<dyn FabricClient>,
    workspace_id: String,
    item_id: String,
    job_type: String,
    parameters: HashMap<String, String>,
}

impl FabricItemJob {
    pub fn new(
        client: Arc<dyn FabricClient>,
        workspace_id: String,
        item_id: String,
        job_type: String,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            client,
            workspace_id,
            item_id,
            job_type,
            parameters,
        }
    }
}

#[async_trait]
impl RemoteOperation for FabricItemJob {
    type Status = FabricJobInstance;

    fn name(&self) -> String {
        format!("Fabric {} job", self.job_type)
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self
            .client
            .run_item_job(
                &self.workspace_id,
                &self.item_id,
                &self.job_type,
                &self.parameters,
            )
            .await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        self.client
            .get_item_job_instance(&self.workspace_id, &self.item_id, run_id)
            .await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client
            .cancel_item_job_instance(&self.workspace_id, &self.item_id, run_id)
            .await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        matches!(
            status.status.as_str(),
            "Completed" | "Failed" | "Cancelled" | "Deduped"
        )
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == "Completed"
    }

    fn describe(&self, status: &Self::Status) -> String {
        match &status.failure_reason {
            Some(reason) => format!(
                "{} finished with status {}: {}",
                self.name(),
                status.status,
                reason
            ),
            None => format!("{} finished with status {}", self.name(), status.status),
        }
    }
}

// Power BI dataset and dataflow refresh adapters

use async_trait::async_trait;
use std::sync::Arc;

use super::poll::{RemoteOperation, StartOutcome};
use crate::errors::ExecutionError;

/// Status of a refresh as reported by Power BI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshStatus {
    pub status: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait PowerBiClient: Send + Sync {
    /// Returns the refresh request id
    async fn refresh_dataset(
        &self,
        workspace_id: &str,
        dataset_id: &str,
    ) -> Result<String, ExecutionError>;

    async fn get_dataset_refresh(
        &self,
        workspace_id: &str,
        dataset_id: &str,
        request_id: &str,
    ) -> Result<RefreshStatus, ExecutionError>;

    async fn cancel_dataset_refresh(
        &self,
        workspace_id: &str,
        dataset_id: &str,
        request_id: &str,
    ) -> Result<(), ExecutionError>;

    /// Returns the dataflow transaction id
    async fn refresh_dataflow(
        &self,
        workspace_id: &str,
        dataflow_id: &str,
    ) -> Result<String, ExecutionError>;

    async fn get_dataflow_transaction(
        &self,
        workspace_id: &str,
        dataflow_id: &str,
        transaction_id: &str,
    ) -> Result<RefreshStatus, ExecutionError>;

    async fn cancel_dataflow_transaction(
        &self,
        workspace_id: &str,
        transaction_id: &str,
    ) -> Result<(), ExecutionError>;
}

fn describe_refresh(kind: &str, status: &RefreshStatus) -> String {
    match &status.error {
        Some(error) => format!("{} refresh finished with status {}: {}", kind, status.status, error),
        None => format!("{} refresh finished with status {}", kind, status.status),
    }
}

pub struct DatasetRefresh {
    client: Arc<dyn PowerBiClient>,
    workspace_id: String,
    dataset_id: String,
}

impl DatasetRefresh {
    pub fn new(client: Arc<dyn PowerBiClient>, workspace_id: String, dataset_id: String) -> Self {
        Self {
            client,
            workspace_id,
            dataset_id,
        }
    }
}

#[async_trait]
impl RemoteOperation for DatasetRefresh {
    type Status = RefreshStatus;

    fn name(&self) -> String {
        "Power BI dataset refresh".to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self
            .client
            .refresh_dataset(&self.workspace_id, &self.dataset_id)
            .await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        self.client
            .get_dataset_refresh(&self.workspace_id, &self.dataset_id, run_id)
            .await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client
            .cancel_dataset_refresh(&self.workspace_id, &self.dataset_id, run_id)
            .await
    }

    // "Unknown" is how the refresh history reports a refresh in progress
    fn is_terminal(&self, status: &Self::Status) -> bool {
        status.status != "Unknown" && status.status != "NotStarted"
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == "Completed"
    }

    fn describe(&self, status: &Self::Status) -> String {
        describe_refresh("Dataset", status)
    }
}

pub struct DataflowRefresh {
    client: Arc<dyn PowerBiClient>,
    workspace_id: String,
    dataflow_id: String,
}

impl DataflowRefresh {
    pub fn new(client: Arc<dyn PowerBiClient>, workspace_id: String, dataflow_id: String) -> Self {
        Self {
            client,
            workspace_id,
            dataflow_id,
        }
    }
}

#[async_trait]
impl RemoteOperation for DataflowRefresh {
    type Status = RefreshStatus;

    fn name(&self) -> String {
        "Power BI dataflow refresh".to_string()
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError> {
        let run_id = self
            .client
            .refresh_dataflow(&self.workspace_id, &self.dataflow_id)
            .await?;
        Ok(StartOutcome::Started { run_id })
    }

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError> {
        self.client
            .get_dataflow_transaction(&self.workspace_id, &self.dataflow_id, run_id)
            .await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError> {
        self.client
            .cancel_dataflow_transaction(&self.workspace_id, run_id)
            .await
    }

    fn is_terminal(&self, status: &Self::Status) -> bool {
        matches!(status.status.as_str(), "Success" | "Failed" | "Cancelled")
    }

    fn is_success(&self, status: &Self::Status) -> bool {
        status.status == "Success"
    }

    fn describe(&self, status: &Self::Status) -> String {
        describe_refresh("Dataflow", status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnusedClient;

    #[async_trait]
    impl PowerBiClient for UnusedClient {
        async fn refresh_dataset(&self, _: &str, _: &str) -> Result<String, ExecutionError> {
            unimplemented!()
        }
        async fn get_dataset_refresh(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<RefreshStatus, ExecutionError> {
            unimplemented!()
        }
        async fn cancel_dataset_refresh(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<(), ExecutionError> {
            unimplemented!()
        }
        async fn refresh_dataflow(&self, _: &str, _: &str) -> Result<String, ExecutionError> {
            unimplemented!()
        }
        async fn get_dataflow_transaction(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<RefreshStatus, ExecutionError> {
            unimplemented!()
        }
        async fn cancel_dataflow_transaction(&self, _: &str, _: &str) -> Result<(), ExecutionError> {
            unimplemented!()
        }
    }

    fn status(s: &str) -> RefreshStatus {
        RefreshStatus {
            status: s.to_string(),
            error: None,
        }
    }

    #[test]
    fn test_unknown_dataset_status_is_in_progress() {
        let refresh = DatasetRefresh::new(Arc::new(UnusedClient), "ws".into(), "ds".into());
        assert!(!refresh.is_terminal(&status("Unknown")));
        assert!(refresh.is_terminal(&status("Failed")));
        assert!(refresh.is_terminal(&status("Disabled")));
        assert!(refresh.is_success(&status("Completed")));
    }

    #[test]
    fn test_dataflow_statuses() {
        let refresh = DataflowRefresh::new(Arc::new(UnusedClient), "ws".into(), "df".into());
        assert!(!refresh.is_terminal(&status("InProgress")));
        assert!(refresh.is_terminal(&status("Cancelled")));
        assert!(!refresh.is_success(&status("Cancelled")));
        assert!(refresh.is_success(&status("Success")));
    }
}

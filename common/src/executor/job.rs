// Nested job step: launches another job as a child execution

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::attempt::AttemptRecorder;
use super::poll::{classify_interruption, report_cancel_failure, REMOTE_CANCEL_TIMEOUT};
use super::StepExecutor;
use crate::cancellation::{CancelReason, CancelSignal, CombinedCancellation, TIMEOUT_ACTOR};
use crate::errors::ExecutionError;
use crate::models::{ExternalId, OrchestrationContext, StepOutcome, StepParameter};
use crate::storage::AttemptStore;

const OPERATION: &str = "job execution";

/// What a job step asks the launcher to create
#[derive(Debug, Clone, PartialEq)]
pub struct ChildExecutionRequest {
    pub job_id: Uuid,
    pub parent: OrchestrationContext,
    pub synchronized: bool,
    /// Parameter overrides passed down from the parent step
    pub parameters: Vec<StepParameter>,
    /// Only steps carrying one of these tags run; empty means all steps
    pub step_tags: Vec<String>,
}

/// JobLauncher materialises and runs job executions on behalf of job steps
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Create a not-yet-started execution and return its id
    async fn create_execution(&self, request: &ChildExecutionRequest)
        -> Result<Uuid, ExecutionError>;

    /// Start the execution in the background
    async fn start_execution(
        &self,
        execution_id: Uuid,
        ctx: &OrchestrationContext,
    ) -> Result<(), ExecutionError>;

    /// Resolve once the execution reached a terminal status
    async fn wait_for_completion(&self, execution_id: Uuid) -> Result<(), ExecutionError>;

    async fn cancel_execution(
        &self,
        execution_id: Uuid,
        requested_by: &str,
    ) -> Result<(), ExecutionError>;
}

pub struct JobStepExecutor {
    launcher: Arc<dyn JobLauncher>,
    store: Arc<dyn AttemptStore>,
    job_id: Uuid,
    synchronized: bool,
    parameters: Vec<StepParameter>,
    step_tags: Vec<String>,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
}

impl JobStepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        launcher: Arc<dyn JobLauncher>,
        store: Arc<dyn AttemptStore>,
        job_id: Uuid,
        synchronized: bool,
        parameters: Vec<StepParameter>,
        step_tags: Vec<String>,
        recorder: Arc<AttemptRecorder>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            launcher,
            store,
            job_id,
            synchronized,
            parameters,
            step_tags,
            recorder,
            timeout,
        }
    }

    async fn run_and_wait(
        &self,
        execution_id: Uuid,
        child: &OrchestrationContext,
    ) -> Result<(), ExecutionError> {
        self.launcher.start_execution(execution_id, child).await?;
        self.launcher.wait_for_completion(execution_id).await
    }

    async fn cancel_child(&self, execution_id: Uuid, combined: &CombinedCancellation) {
        let requested_by = match combined.reason() {
            CancelReason::UserRequested { by } => by,
            _ => TIMEOUT_ACTOR.to_string(),
        };
        let cancelled = tokio::time::timeout(
            REMOTE_CANCEL_TIMEOUT,
            self.launcher.cancel_execution(execution_id, &requested_by),
        )
        .await;
        let error = match cancelled {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => ExecutionError::cancel_failed(OPERATION, "request timed out"),
        };
        report_cancel_failure(&self.recorder, &format!("execution {}", execution_id), &error)
            .await;
    }

    async fn map_child_status(&self, execution_id: Uuid) -> StepOutcome {
        let status = match self.store.read_job_execution_status(execution_id).await {
            Ok(status) => status,
            Err(e) => {
                self.recorder
                    .add_error(format!(
                        "Could not read status of job execution {}: {}",
                        execution_id, e
                    ))
                    .await;
                return StepOutcome::Failure;
            }
        };
        let outcome = status.as_step_outcome();
        let message = format!("Job execution {} finished with status {}", execution_id, status);
        match outcome {
            StepOutcome::Success => self.recorder.add_info(message).await,
            _ => self.recorder.add_error(message).await,
        }
        outcome
    }
}

#[async_trait]
impl StepExecutor for JobStepExecutor {
    #[tracing::instrument(skip_all, fields(attempt = %self.recorder.key(), job_id = %self.job_id))]
    async fn execute(&self, ctx: &OrchestrationContext, cancel: &CancelSignal) -> StepOutcome {
        let request = ChildExecutionRequest {
            job_id: self.job_id,
            parent: ctx.clone(),
            synchronized: self.synchronized,
            parameters: self.parameters.clone(),
            step_tags: self.step_tags.clone(),
        };

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.recorder
                    .add_warning(format!(
                        "{} was cancelled by {} before it started",
                        OPERATION,
                        cancel.requested_by()
                    ))
                    .await;
                return StepOutcome::Cancel;
            }
            created = self.launcher.create_execution(&request) => created,
        };
        let execution_id = match created {
            Ok(id) => id,
            Err(e) => {
                self.recorder.add_error(e.to_string()).await;
                return StepOutcome::Failure;
            }
        };
        self.recorder
            .record_external_id(ExternalId::ChildExecution(execution_id))
            .await;
        let child = ctx.child(execution_id, self.synchronized);

        if !self.synchronized {
            return match self.launcher.start_execution(execution_id, &child).await {
                Ok(()) => {
                    self.recorder
                        .add_info(format!("Started job execution {}", execution_id))
                        .await;
                    StepOutcome::Success
                }
                Err(e) => {
                    self.recorder.add_error(e.to_string()).await;
                    StepOutcome::Failure
                }
            };
        }

        let combined = CombinedCancellation::start(cancel, self.timeout);
        let waited = tokio::select! {
            biased;
            _ = combined.cancelled() => None,
            waited = self.run_and_wait(execution_id, &child) => Some(waited),
        };

        match waited {
            None => {
                self.cancel_child(execution_id, &combined).await;
                classify_interruption(&self.recorder, &combined, OPERATION).await
            }
            Some(Err(e)) => {
                self.recorder.add_error(e.to_string()).await;
                StepOutcome::Failure
            }
            Some(Ok(())) => self.map_child_status(execution_id).await,
        }
    }
}

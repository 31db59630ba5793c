// Attempt persistence: keyed narrow updates and ordered message lists

pub mod memory;

pub use memory::MemoryAttemptStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StorageError;
use crate::models::{
    AttemptKey, ExternalId, JobExecutionStatus, MessageKind, StepExecutionAttempt,
};
use crate::output::MessageText;

/// A single column of an attempt record
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptField {
    ExternalId(ExternalId),
    /// Overwrite one existing message of a list
    Message {
        kind: MessageKind,
        index: usize,
        message: MessageText,
    },
}

impl AttemptField {
    pub fn column(&self) -> &'static str {
        match self {
            AttemptField::ExternalId(_) => "external_id",
            AttemptField::Message { kind, .. } => kind.column(),
        }
    }
}

/// AttemptStore persists step execution attempts.
///
/// Partial updates touch one column only so that they cannot overwrite
/// concurrent updates of other columns of the same attempt.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Insert a new attempt. Fails if the key already exists.
    async fn create_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError>;

    /// Overwrite one column of an existing attempt
    async fn update_attempt_field(
        &self,
        key: &AttemptKey,
        field: AttemptField,
    ) -> Result<(), StorageError>;

    /// Append one message to the end of a message list
    async fn append_message(
        &self,
        key: &AttemptKey,
        kind: MessageKind,
        message: MessageText,
    ) -> Result<(), StorageError>;

    /// Write the result, end time and final message lists
    async fn finalize_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError>;

    async fn get_attempt(&self, key: &AttemptKey) -> Result<StepExecutionAttempt, StorageError>;

    /// Register a job execution launched by a job step
    async fn create_job_execution(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        parent_execution_id: Option<Uuid>,
    ) -> Result<(), StorageError>;

    async fn set_job_execution_status(
        &self,
        execution_id: Uuid,
        status: JobExecutionStatus,
    ) -> Result<(), StorageError>;

    /// Status of a whole job execution, used by nested job steps
    async fn read_job_execution_status(
        &self,
        execution_id: Uuid,
    ) -> Result<JobExecutionStatus, StorageError>;
}

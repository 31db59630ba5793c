// In-process attempt store

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AttemptField, AttemptStore};
use crate::errors::StorageError;
use crate::models::{AttemptKey, JobExecutionStatus, MessageKind, StepExecutionAttempt};
use crate::output::MessageText;

/// MemoryAttemptStore keeps attempts and job execution statuses in memory.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    attempts: RwLock<HashMap<AttemptKey, StepExecutionAttempt>>,
    job_statuses: RwLock<HashMap<Uuid, JobExecutionStatus>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All attempts of one step, ordered by retry index
    pub async fn attempts_for_step(
        &self,
        execution_id: Uuid,
        step_id: Uuid,
    ) -> Vec<StepExecutionAttempt> {
        let attempts = self.attempts.read().await;
        let mut found: Vec<StepExecutionAttempt> = attempts
            .values()
            .filter(|a| a.execution_id == execution_id && a.step_id == step_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.retry_attempt_index);
        found
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn create_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
        let mut attempts = self.attempts.write().await;
        let key = attempt.key();
        if attempts.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        attempts.insert(key, attempt.clone());
        Ok(())
    }

    async fn update_attempt_field(
        &self,
        key: &AttemptKey,
        field: AttemptField,
    ) -> Result<(), StorageError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        match field {
            AttemptField::ExternalId(id) => attempt.external_id = Some(id),
            AttemptField::Message {
                kind,
                index,
                message,
            } => {
                let slot = attempt.messages_mut(kind).get_mut(index).ok_or_else(|| {
                    StorageError::NotFound(format!("{} message {} of {}", kind.column(), index, key))
                })?;
                *slot = message;
            }
        }
        Ok(())
    }

    async fn append_message(
        &self,
        key: &AttemptKey,
        kind: MessageKind,
        message: MessageText,
    ) -> Result<(), StorageError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        attempt.messages_mut(kind).push(message);
        Ok(())
    }

    async fn finalize_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
        let mut attempts = self.attempts.write().await;
        let key = attempt.key();
        let stored = attempts
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        stored.result = attempt.result;
        stored.ended_at = attempt.ended_at;
        stored.info_messages = attempt.info_messages.clone();
        stored.warning_messages = attempt.warning_messages.clone();
        stored.error_messages = attempt.error_messages.clone();
        if attempt.external_id.is_some() {
            stored.external_id = attempt.external_id.clone();
        }
        Ok(())
    }

    async fn get_attempt(&self, key: &AttemptKey) -> Result<StepExecutionAttempt, StorageError> {
        self.attempts
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn create_job_execution(
        &self,
        execution_id: Uuid,
        _job_id: Uuid,
        _parent_execution_id: Option<Uuid>,
    ) -> Result<(), StorageError> {
        let mut statuses = self.job_statuses.write().await;
        if statuses.contains_key(&execution_id) {
            return Err(StorageError::AlreadyExists(format!(
                "job execution {}",
                execution_id
            )));
        }
        statuses.insert(execution_id, JobExecutionStatus::NotStarted);
        Ok(())
    }

    async fn set_job_execution_status(
        &self,
        execution_id: Uuid,
        status: JobExecutionStatus,
    ) -> Result<(), StorageError> {
        self.job_statuses.write().await.insert(execution_id, status);
        Ok(())
    }

    async fn read_job_execution_status(
        &self,
        execution_id: Uuid,
    ) -> Result<JobExecutionStatus, StorageError> {
        self.job_statuses
            .read()
            .await
            .get(&execution_id)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("job execution {}", execution_id)))
    }
}

// Step execution attempt repository backed by PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::queries::attempt_queries;
use crate::db::DbPool;
use crate::errors::{DatabaseError, StorageError};
use crate::models::{
    AttemptKey, ExternalId, JobExecutionStatus, MessageKind, StepExecutionAttempt, StepOutcome,
    StepType,
};
use crate::output::MessageText;
use crate::storage::{AttemptField, AttemptStore};

/// Attempt store writing to the step_execution_attempts table
#[derive(Debug, Clone)]
pub struct PgAttemptStore {
    pool: DbPool,
}

impl PgAttemptStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_attempt(row: &sqlx::postgres::PgRow) -> Result<StepExecutionAttempt, StorageError> {
        let step_type: String = row.try_get("step_type")?;
        let step_type: StepType =
            serde_json::from_value(serde_json::Value::String(step_type))?;
        let result: Option<String> = row.try_get("result")?;
        let result = result
            .map(|r| r.parse::<StepOutcome>())
            .transpose()
            .map_err(StorageError::InvalidJson)?;
        let external_id: Option<Json<ExternalId>> = row.try_get("external_id")?;
        let info_messages: Json<Vec<MessageText>> = row.try_get("info_messages")?;
        let warning_messages: Json<Vec<MessageText>> = row.try_get("warning_messages")?;
        let error_messages: Json<Vec<MessageText>> = row.try_get("error_messages")?;
        let started_at: DateTime<Utc> = row.try_get("started_at")?;
        let ended_at: Option<DateTime<Utc>> = row.try_get("ended_at")?;

        Ok(StepExecutionAttempt {
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            retry_attempt_index: row.try_get("retry_attempt_index")?,
            step_type,
            started_at,
            ended_at,
            result,
            external_id: external_id.map(|Json(id)| id),
            info_messages: info_messages.0,
            warning_messages: warning_messages.0,
            error_messages: error_messages.0,
        })
    }

    fn not_found(key: &AttemptKey, rows_affected: u64) -> Result<(), StorageError> {
        if rows_affected == 0 {
            return Err(StorageError::NotFound(format!("Attempt not found: {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    #[instrument(skip(self, attempt), fields(attempt = %attempt.key()))]
    async fn create_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO step_execution_attempts (
                execution_id, step_id, retry_attempt_index, step_type,
                started_at, ended_at, result, external_id,
                info_messages, warning_messages, error_messages
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.execution_id)
        .bind(attempt.step_id)
        .bind(attempt.retry_attempt_index)
        .bind(attempt.step_type.as_str())
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .bind(attempt.result.map(|r| r.to_string()))
        .bind(attempt.external_id.as_ref().map(Json))
        .bind(Json(&attempt.info_messages))
        .bind(Json(&attempt.warning_messages))
        .bind(Json(&attempt.error_messages))
        .execute(self.pool.pool())
        .await
        .map_err(|e| StorageError::from(DatabaseError::from(e)))?;

        tracing::debug!(attempt = %attempt.key(), "Attempt created");
        Ok(())
    }

    #[instrument(skip(self, field), fields(attempt = %key, column = field.column()))]
    async fn update_attempt_field(
        &self,
        key: &AttemptKey,
        field: AttemptField,
    ) -> Result<(), StorageError> {
        let column = field.column();
        let sql = match &field {
            AttemptField::ExternalId(_) => format!(
                "UPDATE step_execution_attempts SET {column} = $4 WHERE {}",
                attempt_queries::KEY_PREDICATE
            ),
            // Only the one array element is written
            AttemptField::Message { .. } => format!(
                "UPDATE step_execution_attempts \
                 SET {column} = jsonb_set({column}, ARRAY[$4::text], $5::jsonb, false) \
                 WHERE {} AND jsonb_array_length({column}) > $4",
                attempt_queries::KEY_PREDICATE
            ),
        };
        let query = sqlx::query(&sql)
            .bind(key.execution_id)
            .bind(key.step_id)
            .bind(key.retry_attempt_index);
        let query = match &field {
            AttemptField::ExternalId(id) => query.bind(Json(id)),
            AttemptField::Message { index, message, .. } => query
                .bind(i32::try_from(*index).unwrap_or(i32::MAX))
                .bind(Json(message)),
        };
        let result = query.execute(self.pool.pool()).await?;
        Self::not_found(key, result.rows_affected())
    }

    #[instrument(skip(self, message), fields(attempt = %key, kind = ?kind))]
    async fn append_message(
        &self,
        key: &AttemptKey,
        kind: MessageKind,
        message: MessageText,
    ) -> Result<(), StorageError> {
        let column = kind.column();
        let sql = format!(
            "UPDATE step_execution_attempts SET {column} = {column} || jsonb_build_array($4::jsonb) WHERE {}",
            attempt_queries::KEY_PREDICATE
        );
        let result = sqlx::query(&sql)
            .bind(key.execution_id)
            .bind(key.step_id)
            .bind(key.retry_attempt_index)
            .bind(Json(&message))
            .execute(self.pool.pool())
            .await?;
        Self::not_found(key, result.rows_affected())
    }

    #[instrument(skip(self, attempt), fields(attempt = %attempt.key()))]
    async fn finalize_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            UPDATE step_execution_attempts
            SET ended_at = $4,
                result = $5,
                external_id = COALESCE($6, external_id),
                info_messages = $7,
                warning_messages = $8,
                error_messages = $9
            WHERE {}
            "#,
            attempt_queries::KEY_PREDICATE
        );
        let key = attempt.key();
        let result = sqlx::query(&sql)
            .bind(key.execution_id)
            .bind(key.step_id)
            .bind(key.retry_attempt_index)
            .bind(attempt.ended_at)
            .bind(attempt.result.map(|r| r.to_string()))
            .bind(attempt.external_id.as_ref().map(Json))
            .bind(Json(&attempt.info_messages))
            .bind(Json(&attempt.warning_messages))
            .bind(Json(&attempt.error_messages))
            .execute(self.pool.pool())
            .await?;
        Self::not_found(&key, result.rows_affected())?;

        tracing::info!(
            attempt = %key,
            result = ?attempt.result,
            "Attempt finalized"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(attempt = %key))]
    async fn get_attempt(&self, key: &AttemptKey) -> Result<StepExecutionAttempt, StorageError> {
        let sql = format!(
            "SELECT {} FROM step_execution_attempts WHERE {}",
            attempt_queries::SELECT_ALL_COLUMNS,
            attempt_queries::KEY_PREDICATE
        );
        let row = sqlx::query(&sql)
            .bind(key.execution_id)
            .bind(key.step_id)
            .bind(key.retry_attempt_index)
            .fetch_optional(self.pool.pool())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Attempt not found: {}", key)))?;
        Self::row_to_attempt(&row)
    }

    #[instrument(skip(self))]
    async fn create_job_execution(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        parent_execution_id: Option<Uuid>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_id, parent_execution_id, status)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(execution_id)
        .bind(job_id)
        .bind(parent_execution_id)
        .bind(JobExecutionStatus::NotStarted.to_string())
        .execute(self.pool.pool())
        .await
        .map_err(|e| StorageError::from(DatabaseError::from(e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_job_execution_status(
        &self,
        execution_id: Uuid,
        status: JobExecutionStatus,
    ) -> Result<(), StorageError> {
        let ended_at = status.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, ended_at = COALESCE($3, ended_at)
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.to_string())
        .bind(ended_at)
        .execute(self.pool.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "Job execution not found: {}",
                execution_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_job_execution_status(
        &self,
        execution_id: Uuid,
    ) -> Result<JobExecutionStatus, StorageError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_executions WHERE id = $1")
                .bind(execution_id)
                .fetch_optional(self.pool.pool())
                .await?;
        let status = status.ok_or_else(|| {
            StorageError::NotFound(format!("Job execution not found: {}", execution_id))
        })?;
        status
            .parse::<JobExecutionStatus>()
            .map_err(StorageError::InvalidJson)
    }
}

// Error handling framework for step execution, persistence and parameter resolution

use thiserror::Error;

/// Step execution errors raised by adapters, backend clients and the attempt runner
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Step execution timed out after {0} minutes")]
    Timeout(f64),

    #[error("Step execution was cancelled by {0}")]
    Cancelled(String),

    #[error("Invalid step configuration: {0}")]
    InvalidStepConfiguration(String),

    #[error("No client configured for {kind} '{id}'")]
    MissingClient { kind: String, id: String },

    #[error("Parameter resolution failed: {0}")]
    ParameterResolutionFailed(String),

    #[error("Error starting {operation}: {reason}")]
    RemoteStartFailed { operation: String, reason: String },

    #[error("Error getting {operation} status: {reason}")]
    RemoteStatusFailed { operation: String, reason: String },

    #[error("Error cancelling {operation}: {reason}")]
    RemoteCancelFailed { operation: String, reason: String },

    #[error("HTTP request failed: {0}")]
    HttpRequestFailed(String),

    #[error("Database connection failed: {0}")]
    DatabaseConnectionFailed(String),

    #[error("Database query failed: {0}")]
    DatabaseQueryFailed(String),

    #[error("Failed to start process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Process execution failed: {0}")]
    ProcessFailed(String),

    #[error("Execution proxy request failed: {0}")]
    ProxyRequestFailed(String),

    #[error("Job execution failed: {0}")]
    JobLaunchFailed(String),

    #[error("Storage operation failed: {0}")]
    StorageFailed(String),
}

impl ExecutionError {
    pub fn start_failed(operation: impl Into<String>, reason: impl ToString) -> Self {
        ExecutionError::RemoteStartFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status_failed(operation: impl Into<String>, reason: impl ToString) -> Self {
        ExecutionError::RemoteStatusFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cancel_failed(operation: impl Into<String>, reason: impl ToString) -> Self {
        ExecutionError::RemoteCancelFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_client(kind: impl Into<String>, id: impl Into<String>) -> Self {
        ExecutionError::MissingClient {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Storage errors raised by attempt stores
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Attempt already exists: {0}")]
    AlreadyExists(String),
}

/// Parameter substitution errors
#[derive(Error, Debug, PartialEq)]
pub enum SubstitutionError {
    #[error("Undefined parameter(s) in template: {parameters:?}. Template: {template}")]
    UndefinedParameter {
        parameters: Vec<String>,
        template: String,
    },

    #[error("Regex compilation error: {0}")]
    RegexError(String),

    #[error("Parameter '{name}' could not be converted to text: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl From<SubstitutionError> for ExecutionError {
    fn from(err: SubstitutionError) -> Self {
        ExecutionError::ParameterResolutionFailed(err.to_string())
    }
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        ExecutionError::StorageFailed(err.to_string())
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<DatabaseError> for StorageError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => StorageError::NotFound(msg),
            DatabaseError::DuplicateKey(msg) => StorageError::AlreadyExists(msg),
            other => StorageError::DatabaseError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

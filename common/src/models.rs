use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, TryFromFloatSecsError};
use uuid::Uuid;

use crate::errors::ExecutionError;
use crate::output::MessageText;

// ============================================================================
// Identity Models
// ============================================================================

/// Key of a step inside one job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub execution_id: Uuid,
    pub step_id: Uuid,
}

/// Key of one retry attempt of a step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub retry_attempt_index: i32,
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.execution_id, self.step_id, self.retry_attempt_index
        )
    }
}

/// OrchestrationContext threads execution identity through nested job calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationContext {
    pub execution_id: Uuid,
    pub parent_execution_id: Option<Uuid>,
    pub synchronized_execution: bool,
}

impl OrchestrationContext {
    /// Context for a root execution started by a schedule or a user
    pub fn root(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            parent_execution_id: None,
            synchronized_execution: false,
        }
    }

    /// Context handed to a child execution launched by a job step
    pub fn child(&self, child_execution_id: Uuid, synchronized: bool) -> Self {
        Self {
            execution_id: child_execution_id,
            parent_execution_id: Some(self.execution_id),
            synchronized_execution: synchronized,
        }
    }

    pub fn is_nested(&self) -> bool {
        self.parent_execution_id.is_some()
    }
}

// ============================================================================
// Step Models
// ============================================================================

/// StepParameter is a resolved runtime parameter of a step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParameter {
    pub name: String,
    pub value: serde_json::Value,
}

/// StepExecution describes one step inside one job execution.
/// It never changes between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    /// 0 means no timeout
    #[serde(default)]
    pub timeout_minutes: f64,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_interval_minutes: f64,
    #[serde(default)]
    pub parameters: Vec<StepParameter>,
    pub config: StepConfig,
}

impl StepExecution {
    pub fn key(&self) -> StepKey {
        StepKey {
            execution_id: self.execution_id,
            step_id: self.step_id,
        }
    }

    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }

    /// Timeout as a duration, None when unbounded
    ///
    /// # Errors
    /// Returns `ExecutionError::InvalidStepConfiguration` when the timeout
    /// does not fit in a `Duration`.
    pub fn timeout(&self) -> Result<Option<Duration>, ExecutionError> {
        minutes_to_duration(self.timeout_minutes).map_err(|_| {
            ExecutionError::InvalidStepConfiguration(format!(
                "Timeout of {} minutes is out of range",
                self.timeout_minutes
            ))
        })
    }

    /// Delay between attempts. Saturates when too large to represent.
    pub fn retry_interval(&self) -> Duration {
        match minutes_to_duration(self.retry_interval_minutes) {
            Ok(interval) => interval.unwrap_or(Duration::ZERO),
            Err(_) => Duration::MAX,
        }
    }
}

fn minutes_to_duration(minutes: f64) -> Result<Option<Duration>, TryFromFloatSecsError> {
    if minutes.is_finite() && minutes > 0.0 {
        Duration::try_from_secs_f64(minutes * 60.0).map(Some)
    } else {
        Ok(None)
    }
}

/// StepType is the tag of the step configuration sum type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Sql,
    HttpTrigger,
    Function,
    Pipeline,
    Databricks,
    DbtCloud,
    PowerBiDatasetRefresh,
    PowerBiDataflowRefresh,
    FabricItemJob,
    QlikReload,
    QlikAutomation,
    Exe,
    Job,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Sql => "sql",
            StepType::HttpTrigger => "http_trigger",
            StepType::Function => "function",
            StepType::Pipeline => "pipeline",
            StepType::Databricks => "databricks",
            StepType::DbtCloud => "dbt_cloud",
            StepType::PowerBiDatasetRefresh => "power_bi_dataset_refresh",
            StepType::PowerBiDataflowRefresh => "power_bi_dataflow_refresh",
            StepType::FabricItemJob => "fabric_item_job",
            StepType::QlikReload => "qlik_reload",
            StepType::QlikAutomation => "qlik_automation",
            StepType::Exe => "exe",
            StepType::Job => "job",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// StepConfig carries the step-type specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Sql(SqlStepConfig),
    HttpTrigger(HttpStepConfig),
    Function(FunctionStepConfig),
    Pipeline(PipelineStepConfig),
    Databricks(DatabricksStepConfig),
    DbtCloud(DbtStepConfig),
    PowerBiDatasetRefresh(DatasetRefreshStepConfig),
    PowerBiDataflowRefresh(DataflowRefreshStepConfig),
    FabricItemJob(FabricStepConfig),
    QlikReload(QlikReloadStepConfig),
    QlikAutomation(QlikAutomationStepConfig),
    Exe(ExeStepConfig),
    Job(JobStepConfig),
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Sql(_) => StepType::Sql,
            StepConfig::HttpTrigger(_) => StepType::HttpTrigger,
            StepConfig::Function(_) => StepType::Function,
            StepConfig::Pipeline(_) => StepType::Pipeline,
            StepConfig::Databricks(_) => StepType::Databricks,
            StepConfig::DbtCloud(_) => StepType::DbtCloud,
            StepConfig::PowerBiDatasetRefresh(_) => StepType::PowerBiDatasetRefresh,
            StepConfig::PowerBiDataflowRefresh(_) => StepType::PowerBiDataflowRefresh,
            StepConfig::FabricItemJob(_) => StepType::FabricItemJob,
            StepConfig::QlikReload(_) => StepType::QlikReload,
            StepConfig::QlikAutomation(_) => StepType::QlikAutomation,
            StepConfig::Exe(_) => StepType::Exe,
            StepConfig::Job(_) => StepType::Job,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlStepConfig {
    pub connection_id: String,
    pub statement: String,
    /// Capture the first column of the first row as step output
    #[serde(default)]
    pub capture_result: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStepConfig {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: Option<HttpAuth>,
}

/// HttpMethod represents HTTP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// HttpAuth represents HTTP authentication methods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionStepConfig {
    pub url: String,
    #[serde(default = "default_function_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub function_key: Option<String>,
    /// Durable functions answer with status endpoints that are polled
    #[serde(default)]
    pub durable: bool,
}

fn default_function_method() -> HttpMethod {
    HttpMethod::Post
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStepConfig {
    pub client_id: String,
    pub pipeline_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabricksStepConfig {
    pub workspace_id: String,
    pub job_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbtStepConfig {
    pub account_id: String,
    pub job_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRefreshStepConfig {
    pub credential_id: String,
    pub workspace_id: String,
    pub dataset_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataflowRefreshStepConfig {
    pub credential_id: String,
    pub workspace_id: String,
    pub dataflow_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricStepConfig {
    pub credential_id: String,
    pub workspace_id: String,
    pub item_id: String,
    pub job_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QlikReloadStepConfig {
    pub environment_id: String,
    pub app_id: String,
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QlikAutomationStepConfig {
    pub environment_id: String,
    pub automation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExeStepConfig {
    pub file_path: String,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub success_exit_code: i32,
    #[serde(default)]
    pub run_as: Option<RunAsUser>,
    /// Delegate execution to a configured execution proxy
    #[serde(default)]
    pub proxy_id: Option<String>,
}

/// Alternate OS credentials for a local process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAsUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStepConfig {
    pub job_to_execute_id: Uuid,
    #[serde(default)]
    pub synchronized: bool,
    #[serde(default)]
    pub filter_step_tags: Vec<String>,
}

/// ExeProxy describes a remote execution endpoint for executables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExeProxy {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

// ============================================================================
// Attempt Models
// ============================================================================

/// StepOutcome is the terminal result of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    /// Only for caller-requested cancellation. Timeouts are failures.
    Cancel,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Success => write!(f, "success"),
            StepOutcome::Failure => write!(f, "failure"),
            StepOutcome::Cancel => write!(f, "cancel"),
        }
    }
}

impl FromStr for StepOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StepOutcome::Success),
            "failure" => Ok(StepOutcome::Failure),
            "cancel" => Ok(StepOutcome::Cancel),
            _ => Err(format!("Invalid step outcome: {}", s)),
        }
    }
}

/// ExternalId identifies the operation an attempt started in another system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExternalId {
    RunId(String),
    ProcessId(u32),
    ProxyTask {
        task_id: String,
        process_id: Option<u32>,
    },
    ChildExecution(Uuid),
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::RunId(id) => write!(f, "{}", id),
            ExternalId::ProcessId(pid) => write!(f, "pid {}", pid),
            ExternalId::ProxyTask {
                task_id,
                process_id: Some(pid),
            } => write!(f, "task {} (pid {})", task_id, pid),
            ExternalId::ProxyTask { task_id, .. } => write!(f, "task {}", task_id),
            ExternalId::ChildExecution(id) => write!(f, "execution {}", id),
        }
    }
}

/// Message list an attempt message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Info,
    Warning,
    Error,
}

impl MessageKind {
    pub fn column(&self) -> &'static str {
        match self {
            MessageKind::Info => "info_messages",
            MessageKind::Warning => "warning_messages",
            MessageKind::Error => "error_messages",
        }
    }
}

/// StepExecutionAttempt is one retry attempt of a step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionAttempt {
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub retry_attempt_index: i32,
    pub step_type: StepType,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<StepOutcome>,
    pub external_id: Option<ExternalId>,
    pub info_messages: Vec<MessageText>,
    pub warning_messages: Vec<MessageText>,
    pub error_messages: Vec<MessageText>,
}

impl StepExecutionAttempt {
    /// Create a new running attempt
    pub fn new(step: &StepExecution, retry_attempt_index: i32) -> Self {
        Self {
            execution_id: step.execution_id,
            step_id: step.step_id,
            retry_attempt_index,
            step_type: step.step_type(),
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            external_id: None,
            info_messages: Vec::new(),
            warning_messages: Vec::new(),
            error_messages: Vec::new(),
        }
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            execution_id: self.execution_id,
            step_id: self.step_id,
            retry_attempt_index: self.retry_attempt_index,
        }
    }

    pub fn messages(&self, kind: MessageKind) -> &[MessageText] {
        match kind {
            MessageKind::Info => &self.info_messages,
            MessageKind::Warning => &self.warning_messages,
            MessageKind::Error => &self.error_messages,
        }
    }

    pub fn messages_mut(&mut self, kind: MessageKind) -> &mut Vec<MessageText> {
        match kind {
            MessageKind::Info => &mut self.info_messages,
            MessageKind::Warning => &mut self.warning_messages,
            MessageKind::Error => &mut self.error_messages,
        }
    }

    /// True when any message of the given kind contains the text
    pub fn has_message_containing(&self, kind: MessageKind, needle: &str) -> bool {
        self.messages(kind)
            .iter()
            .any(|m| m.as_str().contains(needle))
    }
}

// ============================================================================
// Job Execution Models
// ============================================================================

/// JobExecutionStatus is the status of a whole job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionStatus {
    NotStarted,
    Running,
    Succeeded,
    Warning,
    Failed,
    Stopped,
    Suspended,
}

impl JobExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobExecutionStatus::NotStarted | JobExecutionStatus::Running)
    }

    /// Outcome of a synchronized job step waiting on this status
    pub fn as_step_outcome(&self) -> StepOutcome {
        match self {
            JobExecutionStatus::Succeeded | JobExecutionStatus::Warning => StepOutcome::Success,
            _ => StepOutcome::Failure,
        }
    }
}

impl fmt::Display for JobExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobExecutionStatus::NotStarted => write!(f, "not_started"),
            JobExecutionStatus::Running => write!(f, "running"),
            JobExecutionStatus::Succeeded => write!(f, "succeeded"),
            JobExecutionStatus::Warning => write!(f, "warning"),
            JobExecutionStatus::Failed => write!(f, "failed"),
            JobExecutionStatus::Stopped => write!(f, "stopped"),
            JobExecutionStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl FromStr for JobExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(JobExecutionStatus::NotStarted),
            "running" => Ok(JobExecutionStatus::Running),
            "succeeded" => Ok(JobExecutionStatus::Succeeded),
            "warning" => Ok(JobExecutionStatus::Warning),
            "failed" => Ok(JobExecutionStatus::Failed),
            "stopped" => Ok(JobExecutionStatus::Stopped),
            "suspended" => Ok(JobExecutionStatus::Suspended),
            _ => Err(format!("Invalid job execution status: {}", s)),
        }
    }
}

impl TryFrom<String> for JobExecutionStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_to_step_outcome() {
        assert_eq!(
            JobExecutionStatus::Succeeded.as_step_outcome(),
            StepOutcome::Success
        );
        assert_eq!(
            JobExecutionStatus::Warning.as_step_outcome(),
            StepOutcome::Success
        );
        for status in [
            JobExecutionStatus::Failed,
            JobExecutionStatus::Stopped,
            JobExecutionStatus::Suspended,
            JobExecutionStatus::Running,
            JobExecutionStatus::NotStarted,
        ] {
            assert_eq!(status.as_step_outcome(), StepOutcome::Failure);
        }
    }

    #[test]
    fn test_step_config_deserializes_with_type_tag() {
        let json = serde_json::json!({
            "type": "databricks",
            "workspace_id": "ws-1",
            "job_id": 42
        });
        let config: StepConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.step_type(), StepType::Databricks);
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let step = StepExecution {
            execution_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            step_name: "noop".to_string(),
            timeout_minutes: 0.0,
            retry_attempts: 0,
            retry_interval_minutes: 0.0,
            parameters: Vec::new(),
            config: StepConfig::Job(JobStepConfig {
                job_to_execute_id: Uuid::new_v4(),
                synchronized: false,
                filter_step_tags: Vec::new(),
            }),
        };
        assert!(step.timeout().unwrap().is_none());
        assert_eq!(step.retry_interval(), Duration::ZERO);
    }

    #[test]
    fn test_out_of_range_durations_do_not_panic() {
        let step: StepExecution = serde_json::from_value(serde_json::json!({
            "execution_id": Uuid::new_v4(),
            "step_id": Uuid::new_v4(),
            "step_name": "forever",
            "timeout_minutes": 1e18,
            "retry_interval_minutes": 1e18,
            "config": {"type": "exe", "file_path": "true"}
        }))
        .unwrap();

        assert!(matches!(
            step.timeout(),
            Err(ExecutionError::InvalidStepConfiguration(_))
        ));
        assert_eq!(step.retry_interval(), Duration::MAX);
    }

    #[test]
    fn test_child_context_links_parent() {
        let root = OrchestrationContext::root(Uuid::new_v4());
        let child_id = Uuid::new_v4();
        let child = root.child(child_id, true);
        assert_eq!(child.parent_execution_id, Some(root.execution_id));
        assert_eq!(child.execution_id, child_id);
        assert!(child.synchronized_execution);
        assert!(child.is_nested());
        assert!(!root.is_nested());
    }

    #[test]
    fn test_step_outcome_round_trip_through_text() {
        for outcome in [StepOutcome::Success, StepOutcome::Failure, StepOutcome::Cancel] {
            assert_eq!(outcome.to_string().parse::<StepOutcome>().unwrap(), outcome);
        }
    }
}

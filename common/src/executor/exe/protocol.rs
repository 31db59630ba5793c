// Wire format of the execution proxy

use serde::{Deserialize, Serialize};

use crate::output::MessageText;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExeRequest {
    pub exe_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExeResponse {
    pub task_id: String,
}

/// Output captured so far by the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default)]
    pub error_output: String,
    #[serde(default)]
    pub error_output_is_truncated: bool,
}

impl TaskOutput {
    pub fn from_messages(process_id: Option<u32>, output: &MessageText, error: &MessageText) -> Self {
        Self {
            process_id,
            output: output.as_str().to_string(),
            output_truncated: output.is_truncated(),
            error_output: error.as_str().to_string(),
            error_output_is_truncated: error.is_truncated(),
        }
    }

    pub fn output_message(&self) -> MessageText {
        MessageText::with_truncation(self.output.clone(), self.output_truncated)
    }

    pub fn error_message(&self) -> MessageText {
        MessageText::with_truncation(self.error_output.clone(), self.error_output_is_truncated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTask {
    #[serde(flatten)]
    pub output: TaskOutput,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    pub error_message: String,
}

/// Task status envelope discriminated by the `status` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ExeTaskStatus {
    Running(TaskOutput),
    Completed(CompletedTask),
    Failed(FailedTask),
}

impl ExeTaskStatus {
    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            ExeTaskStatus::Running(output) => Some(output),
            ExeTaskStatus::Completed(completed) => Some(&completed.output),
            ExeTaskStatus::Failed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completed_status_is_flat_and_tagged() {
        let status = ExeTaskStatus::Completed(CompletedTask {
            output: TaskOutput {
                process_id: Some(4242),
                output: "done\n".to_string(),
                ..TaskOutput::default()
            },
            exit_code: 0,
        });
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "Completed");
        assert_eq!(value["processId"], 4242);
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["errorOutputIsTruncated"], false);
    }

    #[test]
    fn test_parses_failed_status() {
        let status: ExeTaskStatus = serde_json::from_value(json!({
            "status": "Failed",
            "errorMessage": "file not found"
        }))
        .unwrap();
        assert_eq!(
            status,
            ExeTaskStatus::Failed(FailedTask {
                error_message: "file not found".to_string()
            })
        );
        assert!(status.output().is_none());
    }
}

// SQL query constants for repositories

/// SQL query fragments for step_execution_attempts table
pub mod attempt_queries {
    /// All columns needed to rebuild a StepExecutionAttempt
    pub const SELECT_ALL_COLUMNS: &str = r#"execution_id, step_id, retry_attempt_index,
        step_type, started_at, ended_at, result, external_id,
        info_messages, warning_messages, error_messages"#;

    pub const KEY_PREDICATE: &str =
        "execution_id = $1 AND step_id = $2 AND retry_attempt_index = $3";
}

// Executable steps: local child processes or tasks on an execution proxy

pub mod process;
pub mod protocol;
pub mod proxy;

pub use process::{split_arguments, LineSink, ProcessExit, ProcessSpec, RunningProcess};
pub use proxy::{ExeProxyClient, ProxyExeExecutor};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::attempt::AttemptRecorder;
use super::poll::{classify_interruption, report_cancel_failure};
use super::StepExecutor;
use crate::cancellation::{CancelSignal, CombinedCancellation};
use crate::errors::ExecutionError;
use crate::models::{ExternalId, MessageKind, OrchestrationContext, StepOutcome};
use crate::output::{PeriodicPublisher, PublishSchedule};

const OPERATION: &str = "process";

/// ExeExecutor runs an executable on this host.
///
/// Standard output streams into an info message and standard error into an
/// error message while the process runs.
pub struct ExeExecutor {
    spec: ProcessSpec,
    success_exit_code: i32,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
    schedule: PublishSchedule,
}

impl ExeExecutor {
    pub fn new(
        spec: ProcessSpec,
        success_exit_code: i32,
        recorder: Arc<AttemptRecorder>,
        timeout: Option<Duration>,
        schedule: PublishSchedule,
    ) -> Self {
        Self {
            spec,
            success_exit_code,
            recorder,
            timeout,
            schedule,
        }
    }

    async fn run(
        &self,
        cancel: &CancelSignal,
        stdout: Arc<dyn LineSink>,
        stderr: Arc<dyn LineSink>,
    ) -> StepOutcome {
        if cancel.is_cancelled() {
            self.recorder
                .add_warning(format!(
                    "{} was cancelled by {} before it started",
                    OPERATION,
                    cancel.requested_by()
                ))
                .await;
            return StepOutcome::Cancel;
        }

        let mut process = match RunningProcess::start(&self.spec, stdout, stderr) {
            Ok(process) => process,
            Err(e) => {
                self.recorder.add_error(e.to_string()).await;
                return StepOutcome::Failure;
            }
        };
        self.recorder
            .record_external_id(ExternalId::ProcessId(process.pid()))
            .await;

        let combined = CombinedCancellation::start(cancel, self.timeout);
        match process.wait(combined.token()).await {
            Ok(ProcessExit::Exited(Some(code))) if code == self.success_exit_code => {
                self.recorder
                    .add_info(format!("Process exited with code {}", code))
                    .await;
                StepOutcome::Success
            }
            Ok(ProcessExit::Exited(Some(code))) => {
                self.recorder
                    .add_error(format!(
                        "Process exited with code {} (expected {})",
                        code, self.success_exit_code
                    ))
                    .await;
                StepOutcome::Failure
            }
            Ok(ProcessExit::Exited(None)) => {
                self.recorder
                    .add_error("Process was terminated by a signal")
                    .await;
                StepOutcome::Failure
            }
            Ok(ProcessExit::Interrupted) => {
                classify_interruption(&self.recorder, &combined, OPERATION).await
            }
            Err(e) => {
                // The process state is unknown, make sure nothing survives
                if let Err(kill_error) = process.kill_tree().await {
                    report_cancel_failure(
                        &self.recorder,
                        &format!("pid {}", process.pid()),
                        &kill_error,
                    )
                    .await;
                }
                self.recorder.add_error(e.to_string()).await;
                StepOutcome::Failure
            }
        }
    }
}

#[async_trait]
impl StepExecutor for ExeExecutor {
    #[tracing::instrument(skip_all, fields(attempt = %self.recorder.key(), file_path = %self.spec.file_path))]
    async fn execute(&self, _ctx: &OrchestrationContext, cancel: &CancelSignal) -> StepOutcome {
        let (stdout_publisher, stdout) = PeriodicPublisher::accumulate(
            "stdout",
            self.recorder.output_sink(MessageKind::Info),
            self.schedule,
        );
        let (stderr_publisher, stderr) = PeriodicPublisher::accumulate(
            "stderr",
            self.recorder.output_sink(MessageKind::Error),
            self.schedule,
        );

        let outcome = self.run(cancel, Arc::new(stdout), Arc::new(stderr)).await;

        stdout_publisher.finish().await;
        stderr_publisher.finish().await;
        outcome
    }
}

/// Build the process spec of an exe step with parameters already substituted
pub fn process_spec(
    file_path: String,
    arguments: Option<&str>,
    working_directory: Option<String>,
    run_as: Option<crate::models::RunAsUser>,
) -> Result<ProcessSpec, ExecutionError> {
    if file_path.trim().is_empty() {
        return Err(ExecutionError::InvalidStepConfiguration(
            "Executable path is empty".to_string(),
        ));
    }
    Ok(ProcessSpec {
        file_path,
        arguments: arguments.map(split_arguments).unwrap_or_default(),
        working_directory,
        run_as,
    })
}

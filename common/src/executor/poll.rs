// Poll-until-terminal protocol shared by adapters of asynchronous remote APIs
//
// start (caller signal only) → persist id → poll with retry under the combined
// signal → terminal mapping, with a best-effort remote cancel on interruption.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{info, warn};

use super::attempt::AttemptRecorder;
use crate::cancellation::{CancelReason, CancelSignal, CombinedCancellation};
use crate::config::ExecutionConfig;
use crate::errors::ExecutionError;
use crate::models::{ExternalId, StepOutcome};
use crate::retry::{retry_cancellable, LinearBackoff, RetryError};
use crate::telemetry;

/// Upper bound for a best-effort remote cancel call
pub const REMOTE_CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of starting a remote operation
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome<S> {
    /// The operation runs remotely under this id
    Started { run_id: String },
    /// The start call already returned a terminal result
    Completed(S),
}

/// RemoteOperation is one backend's start/status/cancel triple plus the
/// predicates that interpret its status.
#[async_trait]
pub trait RemoteOperation: Send + Sync {
    type Status: Debug + Send + Sync;

    /// Human readable operation name used in messages, e.g. "Databricks job run"
    fn name(&self) -> String;

    /// Validate inputs before anything is sent to the remote system
    fn validate(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn start(&self) -> Result<StartOutcome<Self::Status>, ExecutionError>;

    async fn status(&self, run_id: &str) -> Result<Self::Status, ExecutionError>;

    async fn cancel(&self, run_id: &str) -> Result<(), ExecutionError>;

    fn is_terminal(&self, status: &Self::Status) -> bool;

    fn is_success(&self, status: &Self::Status) -> bool;

    /// Diagnostic text for a terminal status
    fn describe(&self, status: &Self::Status) -> String;

    fn external_id(&self, run_id: &str) -> ExternalId {
        ExternalId::RunId(run_id.to_string())
    }

    /// A newer external id carried by a polled status, if it changed
    fn updated_external_id(&self, _run_id: &str, _status: &Self::Status) -> Option<ExternalId> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub polling_interval: Duration,
}

impl From<&ExecutionConfig> for PollSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            polling_interval: config.polling_interval(),
        }
    }
}

/// Drive a remote operation to a terminal state.
#[tracing::instrument(
    skip_all,
    fields(attempt = %recorder.key(), operation = %operation.name())
)]
pub async fn run_until_terminal<O>(
    operation: &O,
    recorder: &AttemptRecorder,
    caller: &CancelSignal,
    timeout: Option<Duration>,
    settings: PollSettings,
) -> StepOutcome
where
    O: RemoteOperation + ?Sized,
{
    let name = operation.name();

    if let Err(e) = operation.validate() {
        recorder.add_error(e.to_string()).await;
        return StepOutcome::Failure;
    }

    // The timeout does not run until the operation exists remotely
    let started = tokio::select! {
        biased;
        _ = caller.cancelled() => {
            recorder
                .add_warning(format!(
                    "{} was cancelled by {} before it started",
                    name,
                    caller.requested_by()
                ))
                .await;
            return StepOutcome::Cancel;
        }
        started = operation.start() => started,
    };

    let run_id = match started {
        Ok(StartOutcome::Started { run_id }) => run_id,
        Ok(StartOutcome::Completed(status)) => {
            return map_terminal(operation, recorder, &status).await;
        }
        Err(e) => {
            recorder.add_error(e.to_string()).await;
            return StepOutcome::Failure;
        }
    };

    let combined = CombinedCancellation::start(caller, timeout);
    recorder
        .record_external_id(operation.external_id(&run_id))
        .await;
    info!(run_id = %run_id, "Remote operation started");

    let retry = LinearBackoff::for_status_checks(settings.polling_interval);
    loop {
        telemetry::record_status_poll(recorder.step_type());
        let polled =
            retry_cancellable(&retry, combined.token(), &name, || operation.status(&run_id)).await;

        let status = match polled {
            Ok(status) => status,
            Err(RetryError::Cancelled) => {
                cancel_remote(operation, recorder, &run_id).await;
                return classify_interruption(recorder, &combined, &name).await;
            }
            Err(RetryError::Exhausted(e)) => {
                recorder.add_error(e.to_string()).await;
                return StepOutcome::Failure;
            }
        };

        // Persisted outside any select so a cancellation cannot drop the write
        if let Some(id) = operation.updated_external_id(&run_id, &status) {
            recorder.record_external_id(id).await;
        }

        if operation.is_terminal(&status) {
            return map_terminal(operation, recorder, &status).await;
        }
        tracing::debug!(run_id = %run_id, status = ?status, "Remote operation still running");

        tokio::select! {
            biased;
            _ = combined.cancelled() => {
                cancel_remote(operation, recorder, &run_id).await;
                return classify_interruption(recorder, &combined, &name).await;
            }
            _ = tokio::time::sleep(settings.polling_interval) => {}
        }
    }
}

async fn map_terminal<O>(operation: &O, recorder: &AttemptRecorder, status: &O::Status) -> StepOutcome
where
    O: RemoteOperation + ?Sized,
{
    let description = operation.describe(status);
    if operation.is_success(status) {
        recorder.add_info(description).await;
        StepOutcome::Success
    } else {
        recorder.add_error(description).await;
        StepOutcome::Failure
    }
}

/// Best-effort remote cancel. Failures only produce warnings.
async fn cancel_remote<O>(operation: &O, recorder: &AttemptRecorder, run_id: &str)
where
    O: RemoteOperation + ?Sized,
{
    let outcome = tokio::time::timeout(REMOTE_CANCEL_TIMEOUT, operation.cancel(run_id)).await;
    let error = match outcome {
        Ok(Ok(())) => {
            info!(run_id = run_id, "Remote operation cancelled");
            return;
        }
        Ok(Err(e)) => e,
        Err(_) => ExecutionError::cancel_failed(operation.name(), "request timed out"),
    };
    report_cancel_failure(recorder, run_id, &error).await;
}

/// Record a failed remote cancellation. The operation may still be running.
pub(crate) async fn report_cancel_failure(
    recorder: &AttemptRecorder,
    target: &str,
    error: &ExecutionError,
) {
    telemetry::record_remote_cancel_failure(recorder.step_type());
    warn!(
        attempt = %recorder.key(),
        target = target,
        error = %error,
        "Remote cancellation failed"
    );
    recorder
        .add_warning(format!("Cancellation of {} failed: {}", target, error))
        .await;
}

/// Map an interruption of the combined signal to Cancel or a timeout Failure
pub(crate) async fn classify_interruption(
    recorder: &AttemptRecorder,
    combined: &CombinedCancellation,
    name: &str,
) -> StepOutcome {
    match combined.reason() {
        CancelReason::TimedOut => {
            let minutes = combined
                .timeout()
                .map(|t| t.as_secs_f64() / 60.0)
                .unwrap_or_default();
            recorder
                .add_error(format!("{}: {}", name, ExecutionError::Timeout(minutes)))
                .await;
            StepOutcome::Failure
        }
        CancelReason::UserRequested { by } => {
            recorder
                .add_warning(format!("{} was cancelled by {}", name, by))
                .await;
            StepOutcome::Cancel
        }
        CancelReason::None => {
            recorder
                .add_warning(format!("{} was cancelled", name))
                .await;
            StepOutcome::Cancel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_settings_from_config() {
        let config = ExecutionConfig {
            polling_interval_ms: 1500,
            ..ExecutionConfig::default()
        };
        assert_eq!(
            PollSettings::from(&config).polling_interval,
            Duration::from_millis(1500)
        );
    }
}

// Property-based tests for the poll-until-terminal protocol

use async_trait::async_trait;
use common::cancellation::CancelSignal;
use common::errors::{ExecutionError, StorageError};
use common::executor::{run_until_terminal, AttemptRecorder, PollSettings, RemoteOperation, StartOutcome};
use common::models::{
    AttemptKey, DatabricksStepConfig, JobExecutionStatus, MessageKind, StepConfig, StepExecution,
    StepExecutionAttempt, StepOutcome,
};
use common::output::MessageText;
use common::storage::{AttemptField, AttemptStore, MemoryAttemptStore};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type CallLog = Arc<Mutex<Vec<String>>>;

/// Attempt store that logs external id writes into the shared call log
struct RecordingStore {
    inner: MemoryAttemptStore,
    log: CallLog,
}

#[async_trait]
impl AttemptStore for RecordingStore {
    async fn create_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
        self.inner.create_attempt(attempt).await
    }

    async fn update_attempt_field(
        &self,
        key: &AttemptKey,
        field: AttemptField,
    ) -> Result<(), StorageError> {
        if let AttemptField::ExternalId(id) = &field {
            self.log.lock().push(format!("external_id:{}", id));
        }
        self.inner.update_attempt_field(key, field).await
    }

    async fn append_message(
        &self,
        key: &AttemptKey,
        kind: MessageKind,
        message: MessageText,
    ) -> Result<(), StorageError> {
        self.inner.append_message(key, kind, message).await
    }

    async fn finalize_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
        self.inner.finalize_attempt(attempt).await
    }

    async fn get_attempt(&self, key: &AttemptKey) -> Result<StepExecutionAttempt, StorageError> {
        self.inner.get_attempt(key).await
    }

    async fn create_job_execution(
        &self,
        execution_id: Uuid,
        job_id: Uuid,
        parent_execution_id: Option<Uuid>,
    ) -> Result<(), StorageError> {
        self.inner
            .create_job_execution(execution_id, job_id, parent_execution_id)
            .await
    }

    async fn set_job_execution_status(
        &self,
        execution_id: Uuid,
        status: JobExecutionStatus,
    ) -> Result<(), StorageError> {
        self.inner.set_job_execution_status(execution_id, status).await
    }

    async fn read_job_execution_status(
        &self,
        execution_id: Uuid,
    ) -> Result<JobExecutionStatus, StorageError> {
        self.inner.read_job_execution_status(execution_id).await
    }
}

/// Remote operation that replays scripted statuses, then reports "Running"
struct ScriptedOperation {
    log: CallLog,
    start: Mutex<Option<Result<StartOutcome<String>, ExecutionError>>>,
    statuses: Mutex<VecDeque<Result<String, ExecutionError>>>,
    /// Cancel this signal during the given status call (1-based)
    cancel_on_poll: Option<(usize, CancelSignal)>,
    fail_cancel: bool,
    polls: AtomicUsize,
}

impl ScriptedOperation {
    fn new(log: CallLog, statuses: Vec<Result<String, ExecutionError>>) -> Self {
        Self {
            log,
            start: Mutex::new(None),
            statuses: Mutex::new(statuses.into()),
            cancel_on_poll: None,
            fail_cancel: false,
            polls: AtomicUsize::new(0),
        }
    }

    fn calls(&self, name: &str) -> usize {
        self.log.lock().iter().filter(|c| c.as_str() == name).count()
    }
}

#[async_trait]
impl RemoteOperation for ScriptedOperation {
    type Status = String;

    fn name(&self) -> String {
        "scripted run".to_string()
    }

    async fn start(&self) -> Result<StartOutcome<String>, ExecutionError> {
        self.log.lock().push("start".to_string());
        self.start.lock().take().unwrap_or(Ok(StartOutcome::Started {
            run_id: "run-1".to_string(),
        }))
    }

    async fn status(&self, _run_id: &str) -> Result<String, ExecutionError> {
        self.log.lock().push("status".to_string());
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, signal)) = &self.cancel_on_poll {
            if *at == poll {
                signal.cancel_by("operator");
            }
        }
        self.statuses
            .lock()
            .pop_front()
            .unwrap_or(Ok("Running".to_string()))
    }

    async fn cancel(&self, _run_id: &str) -> Result<(), ExecutionError> {
        self.log.lock().push("cancel".to_string());
        if self.fail_cancel {
            return Err(ExecutionError::cancel_failed("scripted run", "HTTP 503"));
        }
        Ok(())
    }

    fn is_terminal(&self, status: &String) -> bool {
        status == "Succeeded" || status == "Failed"
    }

    fn is_success(&self, status: &String) -> bool {
        status == "Succeeded"
    }

    fn describe(&self, status: &String) -> String {
        format!("Scripted run finished with status {}", status)
    }
}

struct Harness {
    log: CallLog,
    store: Arc<RecordingStore>,
    recorder: AttemptRecorder,
}

async fn harness() -> Harness {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(RecordingStore {
        inner: MemoryAttemptStore::new(),
        log: Arc::clone(&log),
    });
    let step = StepExecution {
        execution_id: Uuid::new_v4(),
        step_id: Uuid::new_v4(),
        step_name: "scripted".to_string(),
        timeout_minutes: 0.0,
        retry_attempts: 0,
        retry_interval_minutes: 0.0,
        parameters: Vec::new(),
        config: StepConfig::Databricks(DatabricksStepConfig {
            workspace_id: "ws".to_string(),
            job_id: 1,
        }),
    };
    let attempt = StepExecutionAttempt::new(&step, 0);
    store.create_attempt(&attempt).await.unwrap();
    let dyn_store: Arc<dyn AttemptStore> = store.clone();
    Harness {
        log,
        store,
        recorder: AttemptRecorder::new(attempt, dyn_store),
    }
}

fn settings() -> PollSettings {
    PollSettings {
        polling_interval: Duration::from_millis(5),
    }
}

/// **Property: Polling stops at the first terminal status**
///
/// *For any* number of non-terminal statuses followed by a terminal one, the
/// attempt polls exactly that many times plus one, persists the run id before
/// the first poll and maps the terminal status to Success or Failure.
#[test]
fn property_poll_until_terminal() {
    proptest!(ProptestConfig::with_cases(16), |(running in 0usize..5, succeeds in any::<bool>())| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = harness().await;
            let mut statuses: Vec<Result<String, ExecutionError>> =
                (0..running).map(|_| Ok("Running".to_string())).collect();
            statuses.push(Ok(if succeeds { "Succeeded" } else { "Failed" }.to_string()));
            let op = ScriptedOperation::new(Arc::clone(&h.log), statuses);

            let outcome =
                run_until_terminal(&op, &h.recorder, &CancelSignal::new(), None, settings()).await;

            let expected = if succeeds { StepOutcome::Success } else { StepOutcome::Failure };
            assert_eq!(outcome, expected);
            assert_eq!(op.calls("status"), running + 1);
            assert_eq!(op.calls("cancel"), 0);

            let log = h.log.lock().clone();
            assert_eq!(log[0], "start");
            assert_eq!(log[1], "external_id:run-1");
            assert_eq!(log[2], "status");

            let kind = if succeeds { MessageKind::Info } else { MessageKind::Error };
            let stored = h.store.get_attempt(&h.recorder.key()).await.unwrap();
            assert!(stored.has_message_containing(kind, "finished with status"));
        });
    });
}

#[tokio::test]
async fn test_cancel_before_start_never_starts_remote_operation() {
    let h = harness().await;
    let op = ScriptedOperation::new(Arc::clone(&h.log), Vec::new());
    let caller = CancelSignal::new();
    caller.cancel_by("alice");

    let outcome = run_until_terminal(&op, &h.recorder, &caller, None, settings()).await;

    assert_eq!(outcome, StepOutcome::Cancel);
    assert_eq!(op.calls("start"), 0);
    assert!(h.recorder.external_id().is_none());
    assert!(h
        .recorder
        .snapshot()
        .has_message_containing(MessageKind::Warning, "cancelled by alice before it started"));
}

#[tokio::test]
async fn test_terminal_status_from_start_skips_polling() {
    let h = harness().await;
    let op = ScriptedOperation::new(Arc::clone(&h.log), Vec::new());
    *op.start.lock() = Some(Ok(StartOutcome::Completed("Succeeded".to_string())));

    let outcome = run_until_terminal(&op, &h.recorder, &CancelSignal::new(), None, settings()).await;

    assert_eq!(outcome, StepOutcome::Success);
    assert_eq!(op.calls("status"), 0);
    assert!(h.recorder.external_id().is_none());
}

#[tokio::test]
async fn test_start_failure_is_failure_without_external_id() {
    let h = harness().await;
    let op = ScriptedOperation::new(Arc::clone(&h.log), Vec::new());
    *op.start.lock() = Some(Err(ExecutionError::start_failed("scripted run", "HTTP 500")));

    let outcome = run_until_terminal(&op, &h.recorder, &CancelSignal::new(), None, settings()).await;

    assert_eq!(outcome, StepOutcome::Failure);
    assert!(h.recorder.external_id().is_none());
    assert!(h
        .recorder
        .snapshot()
        .has_message_containing(MessageKind::Error, "Error starting scripted run"));
}

#[tokio::test]
async fn test_user_cancel_while_polling_cancels_remote_once() {
    let h = harness().await;
    let caller = CancelSignal::new();
    let mut op = ScriptedOperation::new(Arc::clone(&h.log), Vec::new());
    op.cancel_on_poll = Some((2, caller.clone()));

    let outcome = run_until_terminal(&op, &h.recorder, &caller, None, settings()).await;

    assert_eq!(outcome, StepOutcome::Cancel);
    assert_eq!(op.calls("cancel"), 1);
    let attempt = h.recorder.snapshot();
    assert!(attempt.has_message_containing(MessageKind::Warning, "cancelled by operator"));
    assert!(attempt.error_messages.is_empty());
}

#[tokio::test]
async fn test_timeout_is_failure_and_cancels_remote() {
    let h = harness().await;
    let op = ScriptedOperation::new(Arc::clone(&h.log), Vec::new());

    let outcome = run_until_terminal(
        &op,
        &h.recorder,
        &CancelSignal::new(),
        Some(Duration::from_millis(100)),
        settings(),
    )
    .await;

    assert_eq!(outcome, StepOutcome::Failure);
    assert_eq!(op.calls("cancel"), 1);
    assert!(h
        .recorder
        .snapshot()
        .has_message_containing(MessageKind::Error, "timed out"));
}

#[tokio::test]
async fn test_failed_remote_cancel_is_only_a_warning() {
    let h = harness().await;
    let caller = CancelSignal::new();
    let mut op = ScriptedOperation::new(Arc::clone(&h.log), Vec::new());
    op.cancel_on_poll = Some((1, caller.clone()));
    op.fail_cancel = true;

    let outcome = run_until_terminal(&op, &h.recorder, &caller, None, settings()).await;

    assert_eq!(outcome, StepOutcome::Cancel);
    let attempt = h.recorder.snapshot();
    assert!(attempt.has_message_containing(MessageKind::Warning, "Cancellation of run-1 failed"));
    assert!(attempt.error_messages.is_empty());
}

#[tokio::test]
async fn test_transient_status_errors_are_retried() {
    let h = harness().await;
    let op = ScriptedOperation::new(
        Arc::clone(&h.log),
        vec![
            Err(ExecutionError::status_failed("scripted run", "HTTP 502")),
            Err(ExecutionError::status_failed("scripted run", "HTTP 502")),
            Ok("Succeeded".to_string()),
        ],
    );

    let outcome = run_until_terminal(&op, &h.recorder, &CancelSignal::new(), None, settings()).await;

    assert_eq!(outcome, StepOutcome::Success);
    assert_eq!(op.calls("status"), 3);
}

#[tokio::test]
async fn test_exhausted_status_retries_fail_without_remote_cancel() {
    let h = harness().await;
    let errors = (0..10)
        .map(|_| Err(ExecutionError::status_failed("scripted run", "HTTP 502")))
        .collect();
    let op = ScriptedOperation::new(Arc::clone(&h.log), errors);

    let outcome = run_until_terminal(&op, &h.recorder, &CancelSignal::new(), None, settings()).await;

    assert_eq!(outcome, StepOutcome::Failure);
    // One call plus three retries
    assert_eq!(op.calls("status"), 4);
    assert_eq!(op.calls("cancel"), 0);
    assert!(h
        .recorder
        .snapshot()
        .has_message_containing(MessageKind::Error, "Error getting scripted run status"));
}

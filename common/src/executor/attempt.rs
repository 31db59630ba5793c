// Attempt recorder: the live view of one step attempt and its narrow writes

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::errors::StorageError;
use crate::models::{
    AttemptKey, ExternalId, MessageKind, StepExecutionAttempt, StepOutcome, StepType,
};
use crate::output::{MessageText, SnapshotSink};
use crate::storage::{AttemptField, AttemptStore};

/// AttemptRecorder owns the in-memory attempt and mirrors every change to
/// the store with single-column writes. Store failures are logged and never
/// change the attempt's result.
pub struct AttemptRecorder {
    key: AttemptKey,
    step_type: StepType,
    store: Arc<dyn AttemptStore>,
    state: Mutex<StepExecutionAttempt>,
    /// Held across an in-memory push and its store append so that message
    /// indexes match in both places
    append_order: tokio::sync::Mutex<()>,
}

impl AttemptRecorder {
    pub fn new(attempt: StepExecutionAttempt, store: Arc<dyn AttemptStore>) -> Self {
        Self {
            key: attempt.key(),
            step_type: attempt.step_type,
            store,
            state: Mutex::new(attempt),
            append_order: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> AttemptKey {
        self.key
    }

    pub fn step_type(&self) -> StepType {
        self.step_type
    }

    pub async fn add_info(&self, message: impl Into<MessageText>) {
        self.add_message(MessageKind::Info, message.into()).await
    }

    pub async fn add_warning(&self, message: impl Into<MessageText>) {
        self.add_message(MessageKind::Warning, message.into()).await
    }

    pub async fn add_error(&self, message: impl Into<MessageText>) {
        self.add_message(MessageKind::Error, message.into()).await
    }

    async fn add_message(&self, kind: MessageKind, message: MessageText) {
        let _ordered = self.append_order.lock().await;
        self.state.lock().messages_mut(kind).push(message.clone());
        if let Err(e) = self.store.append_message(&self.key, kind, message).await {
            warn!(
                attempt = %self.key,
                kind = ?kind,
                error = %e,
                "Failed to persist attempt message"
            );
        }
    }

    /// Persist the external operation id.
    ///
    /// Callers await this before interacting with the operation again and
    /// never race it against cancellation; losing the id would leave the
    /// operation unobservable.
    pub async fn record_external_id(&self, id: ExternalId) {
        self.state.lock().external_id = Some(id.clone());
        tracing::info!(attempt = %self.key, external_id = %id, "Recording external id");
        if let Err(e) = self
            .store
            .update_attempt_field(&self.key, AttemptField::ExternalId(id))
            .await
        {
            warn!(attempt = %self.key, error = %e, "Failed to persist external id");
        }
    }

    pub fn external_id(&self) -> Option<ExternalId> {
        self.state.lock().external_id.clone()
    }

    /// Set the result. Only the first call has an effect.
    pub fn complete(&self, outcome: StepOutcome) -> bool {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return false;
        }
        state.result = Some(outcome);
        state.ended_at = Some(Utc::now());
        true
    }

    pub fn result(&self) -> Option<StepOutcome> {
        self.state.lock().result
    }

    pub fn snapshot(&self) -> StepExecutionAttempt {
        self.state.lock().clone()
    }

    /// Sink that keeps one streamed message of the given kind up to date
    pub fn output_sink(self: &Arc<Self>, kind: MessageKind) -> Arc<dyn SnapshotSink> {
        Arc::new(AttemptOutputSink {
            recorder: Arc::clone(self),
            kind,
            slot: Mutex::new(None),
        })
    }

    /// Replace (or reserve on first use) one message and persist only it
    async fn update_streamed_message(
        &self,
        kind: MessageKind,
        slot: &Mutex<Option<usize>>,
        snapshot: MessageText,
    ) -> Result<(), StorageError> {
        let reserved = *slot.lock();
        let replaced = reserved.and_then(|index| {
            let mut state = self.state.lock();
            let message = state.messages_mut(kind).get_mut(index)?;
            message.replace_with(&snapshot);
            Some((index, message.clone()))
        });
        if let Some((index, message)) = replaced {
            return self
                .store
                .update_attempt_field(
                    &self.key,
                    AttemptField::Message {
                        kind,
                        index,
                        message,
                    },
                )
                .await;
        }

        let _ordered = self.append_order.lock().await;
        {
            let mut state = self.state.lock();
            let list = state.messages_mut(kind);
            list.push(snapshot.clone());
            *slot.lock() = Some(list.len() - 1);
        }
        self.store.append_message(&self.key, kind, snapshot).await
    }
}

/// Publishes streamed output into one message slot of an attempt
struct AttemptOutputSink {
    recorder: Arc<AttemptRecorder>,
    kind: MessageKind,
    slot: Mutex<Option<usize>>,
}

#[async_trait]
impl SnapshotSink for AttemptOutputSink {
    async fn publish(&self, snapshot: MessageText) -> Result<(), StorageError> {
        self.recorder
            .update_streamed_message(self.kind, &self.slot, snapshot)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobExecutionStatus, JobStepConfig, StepConfig, StepExecution};
    use crate::storage::MemoryAttemptStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn job_step() -> StepExecution {
        StepExecution {
            execution_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            step_name: "step".to_string(),
            timeout_minutes: 0.0,
            retry_attempts: 0,
            retry_interval_minutes: 0.0,
            parameters: Vec::new(),
            config: StepConfig::Job(JobStepConfig {
                job_to_execute_id: Uuid::new_v4(),
                synchronized: false,
                filter_step_tags: Vec::new(),
            }),
        }
    }

    async fn recorder() -> (Arc<AttemptRecorder>, Arc<MemoryAttemptStore>) {
        let store = Arc::new(MemoryAttemptStore::new());
        let attempt = StepExecutionAttempt::new(&job_step(), 0);
        store.create_attempt(&attempt).await.unwrap();
        (Arc::new(AttemptRecorder::new(attempt, store.clone())), store)
    }

    #[tokio::test]
    async fn test_result_is_set_once() {
        let (recorder, _) = recorder().await;
        assert!(recorder.complete(StepOutcome::Cancel));
        assert!(!recorder.complete(StepOutcome::Success));
        assert_eq!(recorder.result(), Some(StepOutcome::Cancel));
        assert!(recorder.snapshot().ended_at.is_some());
    }

    #[tokio::test]
    async fn test_messages_are_mirrored_to_store() {
        let (recorder, store) = recorder().await;
        recorder.add_info("one").await;
        recorder.add_error("two").await;
        recorder
            .record_external_id(ExternalId::RunId("run-9".to_string()))
            .await;

        let stored = store.get_attempt(&recorder.key()).await.unwrap();
        assert_eq!(stored.info_messages[0].as_str(), "one");
        assert_eq!(stored.error_messages[0].as_str(), "two");
        assert_eq!(stored.external_id, Some(ExternalId::RunId("run-9".into())));
    }

    #[tokio::test]
    async fn test_output_sink_reuses_its_slot() {
        let (recorder, store) = recorder().await;
        recorder.add_info("before").await;
        let sink = recorder.output_sink(MessageKind::Info);

        sink.publish(MessageText::new("a\n")).await.unwrap();
        sink.publish(MessageText::new("a\nb\n")).await.unwrap();

        let stored = store.get_attempt(&recorder.key()).await.unwrap();
        assert_eq!(stored.info_messages.len(), 2);
        assert_eq!(stored.info_messages[1].as_str(), "a\nb\n");
        assert_eq!(recorder.snapshot().info_messages[1].as_str(), "a\nb\n");
    }

    /// Store whose appends of the message "slow" take a while
    struct SlowAppendStore {
        inner: MemoryAttemptStore,
    }

    #[async_trait]
    impl AttemptStore for SlowAppendStore {
        async fn create_attempt(&self, attempt: &StepExecutionAttempt) -> Result<(), StorageError> {
            self.inner.create_attempt(attempt).await
        }

        async fn update_attempt_field(
            &self,
            key: &AttemptKey,
            field: AttemptField,
        ) -> Result<(), StorageError> {
            self.inner.update_attempt_field(key, field).await
        }

        async fn append_message(
            &self,
            key: &AttemptKey,
            kind: MessageKind,
            message: MessageText,
        ) -> Result<(), StorageError> {
            if message.as_str() == "slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
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

    async fn slow_recorder() -> (Arc<AttemptRecorder>, Arc<SlowAppendStore>) {
        let store = Arc::new(SlowAppendStore {
            inner: MemoryAttemptStore::new(),
        });
        let attempt = StepExecutionAttempt::new(&job_step(), 0);
        store.create_attempt(&attempt).await.unwrap();
        (Arc::new(AttemptRecorder::new(attempt, store.clone())), store)
    }

    fn texts(messages: &[MessageText]) -> Vec<&str> {
        messages.iter().map(|m| m.as_str()).collect()
    }

    #[tokio::test]
    async fn test_streamed_update_during_pending_append() {
        let (recorder, store) = slow_recorder().await;
        let sink = recorder.output_sink(MessageKind::Info);
        sink.publish(MessageText::new("a\n")).await.unwrap();

        let appending = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.add_info("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.publish(MessageText::new("a\nb\n")).await.unwrap();
        appending.await.unwrap();

        let stored = store.get_attempt(&recorder.key()).await.unwrap();
        assert_eq!(texts(&stored.info_messages), vec!["a\nb\n", "slow"]);
        assert_eq!(texts(&recorder.snapshot().info_messages), vec!["a\nb\n", "slow"]);
    }

    #[tokio::test]
    async fn test_first_publish_waits_for_pending_append() {
        let (recorder, store) = slow_recorder().await;
        let sink = recorder.output_sink(MessageKind::Info);

        let appending = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.add_info("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.publish(MessageText::new("a\n")).await.unwrap();
        sink.publish(MessageText::new("a\nb\n")).await.unwrap();
        appending.await.unwrap();

        let stored = store.get_attempt(&recorder.key()).await.unwrap();
        assert_eq!(texts(&stored.info_messages), vec!["slow", "a\nb\n"]);
        assert_eq!(texts(&recorder.snapshot().info_messages), vec!["slow", "a\nb\n"]);
    }
}

// Executor module for step attempts
// Provides the executor contract, dispatch and one adapter per step type

pub mod attempt;
pub mod clients;
pub mod databricks;
pub mod dbt;
pub mod dispatch;
pub mod exe;
pub mod fabric;
pub mod function;
pub mod http;
pub mod job;
pub mod pipeline;
pub mod poll;
pub mod powerbi;
pub mod qlik;
pub mod runner;
pub mod sql;

pub use attempt::AttemptRecorder;
pub use clients::{ClientProvider, ConfiguredClients};
pub use dispatch::build_executor;
pub use job::JobLauncher;
pub use poll::{run_until_terminal, PollSettings, RemoteOperation, StartOutcome};
pub use runner::AttemptRunner;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancelSignal;
use crate::config::ExecutionConfig;
use crate::models::{OrchestrationContext, StepOutcome};
use crate::output::PublishSchedule;
use crate::storage::AttemptStore;

/// StepExecutor drives one step attempt against its backend.
///
/// Executors own their attempt recorder; every message and the external id
/// are written through it. The caller's signal is combined with the step
/// timeout inside the executor once the remote operation exists.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &OrchestrationContext, cancel: &CancelSignal) -> StepOutcome;

    /// Release live client resources. Called on every exit path.
    async fn dispose(&self) {}
}

/// Shared collaborators handed to executors at construction
#[derive(Clone)]
pub struct ExecutorServices {
    pub store: Arc<dyn AttemptStore>,
    pub clients: Arc<dyn ClientProvider>,
    pub launcher: Arc<dyn JobLauncher>,
    pub http: reqwest::Client,
    pub execution: ExecutionConfig,
}

impl ExecutorServices {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::from(&self.execution)
    }

    pub fn publish_schedule(&self) -> PublishSchedule {
        PublishSchedule::from(&self.execution.publisher)
    }
}

/// Executor for any backend expressed as a RemoteOperation
pub struct PollingExecutor<O> {
    operation: O,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
    settings: PollSettings,
}

impl<O: RemoteOperation> PollingExecutor<O> {
    pub fn new(
        operation: O,
        recorder: Arc<AttemptRecorder>,
        timeout: Option<Duration>,
        settings: PollSettings,
    ) -> Self {
        Self {
            operation,
            recorder,
            timeout,
            settings,
        }
    }
}

#[async_trait]
impl<O: RemoteOperation + 'static> StepExecutor for PollingExecutor<O> {
    async fn execute(&self, _ctx: &OrchestrationContext, cancel: &CancelSignal) -> StepOutcome {
        run_until_terminal(
            &self.operation,
            &self.recorder,
            cancel,
            self.timeout,
            self.settings,
        )
        .await
    }
}

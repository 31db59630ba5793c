// In-process job launcher for nested job steps

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use common::cancellation::CancelSignal;
use common::errors::ExecutionError;
use common::executor::job::{ChildExecutionRequest, JobLauncher};
use common::executor::AttemptRunner;
use common::models::{
    JobExecutionStatus, OrchestrationContext, StepConfig, StepExecution, StepOutcome,
    StepParameter,
};
use common::storage::AttemptStore;

/// A job that nested job steps can launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<JobStepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStepDefinition {
    pub step_id: Uuid,
    pub step_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
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

impl JobDefinition {
    /// Steps of one execution of this job, filtered by tag, with the
    /// parent's parameter overrides applied by name
    fn step_executions(
        &self,
        execution_id: Uuid,
        request: &ChildExecutionRequest,
    ) -> Vec<StepExecution> {
        self.steps
            .iter()
            .filter(|step| {
                request.step_tags.is_empty()
                    || step.tags.iter().any(|tag| request.step_tags.contains(tag))
            })
            .map(|step| StepExecution {
                execution_id,
                step_id: step.step_id,
                step_name: step.step_name.clone(),
                timeout_minutes: step.timeout_minutes,
                retry_attempts: step.retry_attempts,
                retry_interval_minutes: step.retry_interval_minutes,
                parameters: merge_parameters(&step.parameters, &request.parameters),
                config: step.config.clone(),
            })
            .collect()
    }
}

fn merge_parameters(
    defaults: &[StepParameter],
    overrides: &[StepParameter],
) -> Vec<StepParameter> {
    let mut merged: Vec<StepParameter> = defaults
        .iter()
        .filter(|p| !overrides.iter().any(|o| o.name == p.name))
        .cloned()
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}

/// Read a job catalog document (a JSON array of job definitions)
pub fn load_catalog(path: &Path) -> anyhow::Result<Vec<JobDefinition>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read job catalog {}: {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid job catalog {}: {}", path.display(), e))
}

struct ChildRun {
    request: ChildExecutionRequest,
    cancel: CancelSignal,
    done: Arc<watch::Sender<bool>>,
    started: bool,
}

type Executions = Arc<Mutex<HashMap<Uuid, ChildRun>>>;

/// InProcessJobLauncher runs child job executions on this worker, one step
/// after the other, through the same attempt runner as the parent.
///
/// Runs are forgotten once finished; their status stays in the store.
pub struct InProcessJobLauncher {
    catalog: HashMap<Uuid, JobDefinition>,
    store: Arc<dyn AttemptStore>,
    runner: OnceLock<Weak<AttemptRunner>>,
    executions: Executions,
}

impl InProcessJobLauncher {
    pub fn new(jobs: Vec<JobDefinition>, store: Arc<dyn AttemptStore>) -> Self {
        Self {
            catalog: jobs.into_iter().map(|job| (job.id, job)).collect(),
            store,
            runner: OnceLock::new(),
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The runner holds this launcher through its services, so only a weak
    /// reference is kept here.
    pub fn attach_runner(&self, runner: &Arc<AttemptRunner>) {
        if self.runner.set(Arc::downgrade(runner)).is_err() {
            warn!("Attempt runner already attached to job launcher");
        }
    }

    fn runner(&self) -> Result<Arc<AttemptRunner>, ExecutionError> {
        self.runner
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ExecutionError::JobLaunchFailed("No attempt runner attached".to_string()))
    }

    /// Number of executions created or running
    pub fn active_executions(&self) -> usize {
        self.executions.lock().len()
    }

    /// Wait until every started execution finished, including those
    /// launched without waiting. Cancelling `caller` cancels them all.
    pub async fn wait_all(&self, caller: &CancelSignal) {
        loop {
            if caller.is_cancelled() {
                self.cancel_all(&caller.requested_by());
            }
            let next = self
                .executions
                .lock()
                .iter()
                .find(|(_, run)| run.started)
                .map(|(id, run)| (*id, run.done.subscribe()));
            let Some((execution_id, mut done)) = next else {
                return;
            };

            info!(execution_id = %execution_id, "Waiting for job execution to finish");
            tokio::select! {
                biased;
                _ = caller.cancelled(), if !caller.is_cancelled() => {}
                _ = done.wait_for(|finished| *finished) => {}
            }
        }
    }

    fn cancel_all(&self, requested_by: &str) {
        for (execution_id, run) in self.executions.lock().iter() {
            if run.started && !run.cancel.is_cancelled() {
                info!(execution_id = %execution_id, requested_by = requested_by, "Cancelling job execution");
                run.cancel.cancel_by(requested_by);
            }
        }
    }

    /// A run no longer tracked is fine when the store shows it finished
    async fn finished_in_store(&self, execution_id: Uuid) -> Result<(), ExecutionError> {
        match self.store.read_job_execution_status(execution_id).await {
            Ok(status) if status.is_terminal() => Ok(()),
            _ => Err(ExecutionError::JobLaunchFailed(format!(
                "Unknown job execution {}",
                execution_id
            ))),
        }
    }
}

#[async_trait]
impl JobLauncher for InProcessJobLauncher {
    #[instrument(skip_all, fields(job_id = %request.job_id))]
    async fn create_execution(
        &self,
        request: &ChildExecutionRequest,
    ) -> Result<Uuid, ExecutionError> {
        if !self.catalog.contains_key(&request.job_id) {
            return Err(ExecutionError::JobLaunchFailed(format!(
                "Job {} not found",
                request.job_id
            )));
        }

        let execution_id = Uuid::new_v4();
        self.store
            .create_job_execution(
                execution_id,
                request.job_id,
                Some(request.parent.execution_id),
            )
            .await
            .map_err(|e| ExecutionError::StorageFailed(e.to_string()))?;

        let (done, _) = watch::channel(false);
        self.executions.lock().insert(
            execution_id,
            ChildRun {
                request: request.clone(),
                cancel: CancelSignal::new(),
                done: Arc::new(done),
                started: false,
            },
        );
        info!(execution_id = %execution_id, "Job execution created");
        Ok(execution_id)
    }

    #[instrument(skip(self, ctx))]
    async fn start_execution(
        &self,
        execution_id: Uuid,
        ctx: &OrchestrationContext,
    ) -> Result<(), ExecutionError> {
        let runner = self.runner()?;
        let (request, cancel, done) = {
            let mut executions = self.executions.lock();
            let run = executions.get_mut(&execution_id).ok_or_else(|| {
                ExecutionError::JobLaunchFailed(format!("Unknown job execution {}", execution_id))
            })?;
            if run.started {
                return Err(ExecutionError::JobLaunchFailed(format!(
                    "Job execution {} already started",
                    execution_id
                )));
            }
            run.started = true;
            (run.request.clone(), run.cancel.clone(), Arc::clone(&run.done))
        };
        let Some(job) = self.catalog.get(&request.job_id) else {
            self.executions.lock().remove(&execution_id);
            return Err(ExecutionError::JobLaunchFailed(format!(
                "Job {} not found",
                request.job_id
            )));
        };
        let steps = job.step_executions(execution_id, &request);

        if let Err(e) = self
            .store
            .set_job_execution_status(execution_id, JobExecutionStatus::Running)
            .await
        {
            self.executions.lock().remove(&execution_id);
            return Err(ExecutionError::StorageFailed(e.to_string()));
        }

        let store = Arc::clone(&self.store);
        let executions = Arc::clone(&self.executions);
        let ctx = ctx.clone();
        let job_name = job.name.clone();
        tokio::spawn(async move {
            let status = run_steps(&runner, &steps, &ctx, &cancel).await;
            info!(execution_id = %execution_id, job = %job_name, status = %status, "Job execution finished");
            if let Err(e) = store.set_job_execution_status(execution_id, status).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to record job execution status");
            }
            // Waiters already subscribed still see the final value
            executions.lock().remove(&execution_id);
            done.send_replace(true);
        });
        Ok(())
    }

    async fn wait_for_completion(&self, execution_id: Uuid) -> Result<(), ExecutionError> {
        let done = self
            .executions
            .lock()
            .get(&execution_id)
            .map(|run| run.done.subscribe());
        let Some(mut done) = done else {
            return self.finished_in_store(execution_id).await;
        };
        done.wait_for(|finished| *finished).await.map_err(|_| {
            ExecutionError::JobLaunchFailed(format!(
                "Job execution {} ended without a status",
                execution_id
            ))
        })?;
        Ok(())
    }

    async fn cancel_execution(
        &self,
        execution_id: Uuid,
        requested_by: &str,
    ) -> Result<(), ExecutionError> {
        let found = {
            let mut executions = self.executions.lock();
            match executions.get(&execution_id) {
                Some(run) if run.started => Some(Some(run.cancel.clone())),
                Some(_) => {
                    executions.remove(&execution_id);
                    Some(None)
                }
                None => None,
            }
        };
        let Some(cancel) = found else {
            return self.finished_in_store(execution_id).await;
        };
        info!(execution_id = %execution_id, requested_by = requested_by, "Cancelling job execution");
        match cancel {
            Some(cancel) => cancel.cancel_by(requested_by),
            None => self
                .store
                .set_job_execution_status(execution_id, JobExecutionStatus::Stopped)
                .await
                .map_err(|e| ExecutionError::StorageFailed(e.to_string()))?,
        }
        Ok(())
    }
}

async fn run_steps(
    runner: &AttemptRunner,
    steps: &[StepExecution],
    ctx: &OrchestrationContext,
    cancel: &CancelSignal,
) -> JobExecutionStatus {
    let mut warned = false;
    for step in steps {
        if cancel.is_cancelled() {
            return JobExecutionStatus::Stopped;
        }
        let attempts = runner.run_step(step, ctx, cancel).await;
        let Some(last) = attempts.last() else {
            return JobExecutionStatus::Failed;
        };
        match last.result {
            Some(StepOutcome::Success) => warned |= !last.warning_messages.is_empty(),
            Some(StepOutcome::Cancel) => return JobExecutionStatus::Stopped,
            _ if cancel.is_cancelled() => return JobExecutionStatus::Stopped,
            _ => return JobExecutionStatus::Failed,
        }
    }
    if warned {
        JobExecutionStatus::Warning
    } else {
        JobExecutionStatus::Succeeded
    }
}

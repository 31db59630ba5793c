// Attempt runner: one attempt per try, append-only retries

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::attempt::AttemptRecorder;
use super::dispatch::build_executor;
use super::ExecutorServices;
use crate::cancellation::CancelSignal;
use crate::models::{OrchestrationContext, StepExecution, StepExecutionAttempt, StepOutcome};
use crate::retry::{FixedDelay, RetryStrategy};
use crate::telemetry;

/// AttemptRunner executes the attempts of a step and keeps their records
#[derive(Clone)]
pub struct AttemptRunner {
    services: ExecutorServices,
}

impl AttemptRunner {
    pub fn new(services: ExecutorServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &ExecutorServices {
        &self.services
    }

    /// Run a step until it succeeds, is cancelled or runs out of retries.
    ///
    /// Returns every attempt made, ordered by retry index.
    #[tracing::instrument(
        skip_all,
        fields(execution_id = %step.execution_id, step_id = %step.step_id, step = %step.step_name)
    )]
    pub async fn run_step(
        &self,
        step: &StepExecution,
        ctx: &OrchestrationContext,
        caller: &CancelSignal,
    ) -> Vec<StepExecutionAttempt> {
        let mut attempts = Vec::new();
        let mut retry_attempt_index: i32 = 0;
        let retries = FixedDelay::new(step.retry_interval(), step.retry_attempts);

        loop {
            let attempt = self
                .run_attempt(step, ctx, caller, retry_attempt_index)
                .await;
            let result = attempt.result;
            attempts.push(attempt);

            if result != Some(StepOutcome::Failure) {
                break;
            }
            let retries_used = u32::try_from(retry_attempt_index).unwrap_or(u32::MAX);
            let Some(interval) = retries.next_delay(retries_used) else {
                break;
            };

            info!(
                retry_attempt_index = retry_attempt_index + 1,
                interval_secs = interval.as_secs_f64(),
                "Retrying failed step"
            );
            tokio::select! {
                biased;
                _ = caller.cancelled() => {
                    info!("Retry wait cancelled, no further attempts");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            retry_attempt_index += 1;
        }

        attempts
    }

    /// Run one attempt and return its final record
    pub async fn run_attempt(
        &self,
        step: &StepExecution,
        ctx: &OrchestrationContext,
        caller: &CancelSignal,
        retry_attempt_index: i32,
    ) -> StepExecutionAttempt {
        let started = Instant::now();
        let store = Arc::clone(&self.services.store);
        let attempt = StepExecutionAttempt::new(step, retry_attempt_index);
        let recorder = Arc::new(AttemptRecorder::new(attempt.clone(), Arc::clone(&store)));

        let outcome = match store.create_attempt(&attempt).await {
            Err(e) => {
                error!(attempt = %attempt.key(), error = %e, "Failed to create attempt record");
                recorder
                    .add_error(format!("Failed to create attempt record: {}", e))
                    .await;
                StepOutcome::Failure
            }
            Ok(()) => self.execute(step, ctx, caller, &recorder).await,
        };

        recorder.complete(outcome);
        let finished = recorder.snapshot();
        if let Err(e) = store.finalize_attempt(&finished).await {
            warn!(attempt = %finished.key(), error = %e, "Failed to finalize attempt record");
        }

        telemetry::record_attempt(
            finished.step_type,
            finished.result.unwrap_or(outcome),
            started.elapsed().as_secs_f64(),
        );
        info!(
            attempt = %finished.key(),
            result = ?finished.result,
            duration_ms = started.elapsed().as_millis() as u64,
            "Step attempt finished"
        );
        finished
    }

    async fn execute(
        &self,
        step: &StepExecution,
        ctx: &OrchestrationContext,
        caller: &CancelSignal,
        recorder: &Arc<AttemptRecorder>,
    ) -> StepOutcome {
        let executor = match build_executor(step, Arc::clone(recorder), &self.services) {
            Ok(executor) => executor,
            Err(e) => {
                recorder.add_error(e.to_string()).await;
                return StepOutcome::Failure;
            }
        };

        let executed = AssertUnwindSafe(executor.execute(ctx, caller))
            .catch_unwind()
            .await;
        executor.dispose().await;

        match executed {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(attempt = %recorder.key(), panic = %message, "Step executor panicked");
                recorder
                    .add_error(format!("Unhandled error: {}", message))
                    .await;
                StepOutcome::Failure
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom 1");

        let panic = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "static");
    }
}

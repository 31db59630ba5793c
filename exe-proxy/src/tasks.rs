// Registry of processes started on behalf of remote workers

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use common::executor::exe::protocol::{
    CompletedTask, ExeTaskStatus, FailedTask, StartExeRequest, TaskOutput,
};
use common::executor::exe::{ProcessExit, ProcessSpec, RunningProcess};
use common::output::MessageBuffer;

#[derive(Debug, Clone, PartialEq)]
enum TaskState {
    Running,
    Completed(i32),
    Failed(String),
}

/// One proxied process and the output it produced so far
struct ProxiedProcess {
    process_id: Option<u32>,
    stdout: MessageBuffer,
    stderr: MessageBuffer,
    cancel: CancellationToken,
    state: Mutex<TaskState>,
}

impl ProxiedProcess {
    fn status(&self) -> ExeTaskStatus {
        let output = TaskOutput::from_messages(
            self.process_id,
            &self.stdout.snapshot(),
            &self.stderr.snapshot(),
        );
        match self.state.lock().clone() {
            TaskState::Running => ExeTaskStatus::Running(output),
            TaskState::Completed(exit_code) => {
                ExeTaskStatus::Completed(CompletedTask { output, exit_code })
            }
            TaskState::Failed(error_message) => {
                ExeTaskStatus::Failed(FailedTask { error_message })
            }
        }
    }

    fn finish(&self, state: TaskState) {
        *self.state.lock() = state;
    }
}

/// TaskRegistry starts processes and answers status and cancel calls by task id
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Arc<ProxiedProcess>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a process and return its task id.
    ///
    /// A process that cannot be spawned still gets a task, reported as failed.
    #[tracing::instrument(skip_all, fields(exe_path = %request.exe_path))]
    pub fn start(&self, request: StartExeRequest) -> String {
        let task_id = Uuid::new_v4().to_string();
        let spec = ProcessSpec {
            file_path: request.exe_path,
            arguments: request.arguments,
            working_directory: request.working_directory,
            run_as: None,
        };
        let stdout = MessageBuffer::new();
        let stderr = MessageBuffer::new();

        let task = match RunningProcess::start(
            &spec,
            Arc::new(stdout.clone()),
            Arc::new(stderr.clone()),
        ) {
            Ok(process) => {
                let task = Arc::new(ProxiedProcess {
                    process_id: Some(process.pid()),
                    stdout,
                    stderr,
                    cancel: CancellationToken::new(),
                    state: Mutex::new(TaskState::Running),
                });
                tokio::spawn(supervise(task_id.clone(), process, Arc::clone(&task)));
                task
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to start process");
                Arc::new(ProxiedProcess {
                    process_id: None,
                    stdout,
                    stderr,
                    cancel: CancellationToken::new(),
                    state: Mutex::new(TaskState::Failed(e.to_string())),
                })
            }
        };

        self.tasks.write().insert(task_id.clone(), task);
        info!(task_id = %task_id, "Task registered");
        task_id
    }

    pub fn status(&self, task_id: &str) -> Option<ExeTaskStatus> {
        self.tasks.read().get(task_id).map(|task| task.status())
    }

    /// Request cancellation. Returns false for unknown tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.read().get(task_id) {
            Some(task) => {
                info!(task_id = %task_id, "Cancelling task");
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Kill every running process, used on shutdown
    pub fn cancel_all(&self) {
        for task in self.tasks.read().values() {
            task.cancel.cancel();
        }
    }
}

async fn supervise(task_id: String, mut process: RunningProcess, task: Arc<ProxiedProcess>) {
    let state = match process.wait(&task.cancel).await {
        Ok(ProcessExit::Exited(Some(code))) => TaskState::Completed(code),
        Ok(ProcessExit::Exited(None)) => {
            TaskState::Failed("Process was terminated by a signal".to_string())
        }
        Ok(ProcessExit::Interrupted) => TaskState::Failed("Process was cancelled".to_string()),
        Err(e) => {
            if let Err(kill_error) = process.kill_tree().await {
                warn!(task_id = %task_id, error = %kill_error, "Failed to kill process tree");
            }
            TaskState::Failed(e.to_string())
        }
    };
    info!(task_id = %task_id, state = ?state, "Task finished");
    task.finish(state);
}

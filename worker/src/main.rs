// Worker binary entry point
// Runs one step execution, with retries, and prints its attempt records

mod launcher;

use anyhow::Result;
use clap::Parser;
use common::cancellation::CancelSignal;
use common::config::Settings;
use common::db::{DbPool, PgAttemptStore};
use common::executor::{AttemptRunner, ConfiguredClients, ExecutorServices};
use common::models::{OrchestrationContext, StepExecution, StepOutcome};
use common::storage::{AttemptStore, MemoryAttemptStore};
use common::telemetry;
use launcher::{load_catalog, InProcessJobLauncher};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Actor recorded when the operator interrupts the worker
const CONSOLE_ACTOR: &str = "console user";

#[derive(Parser, Debug)]
#[command(name = "worker", version, about = "Execute one ETL step with retries")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Step execution document (JSON)
    #[arg(long)]
    step: PathBuf,

    /// Job catalog used by nested job steps (JSON array)
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Apply database migrations before running
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config_dir)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let observability = &settings.observability;
    telemetry::init_logging(
        "worker",
        &observability.log_level,
        observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(config_dir = %cli.config_dir.display(), "Configuration loaded successfully");

    let step = read_step(&cli.step)?;
    let jobs = match &cli.jobs {
        Some(path) => load_catalog(path)?,
        None => Vec::new(),
    };

    let store = open_store(&settings, cli.migrate).await?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("etl-step-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| anyhow::anyhow!("HTTP client initialization error: {}", e))?;
    let clients = ConfiguredClients::from_settings(&settings.connections, http.clone());

    let launcher = Arc::new(InProcessJobLauncher::new(jobs, Arc::clone(&store)));
    let runner = Arc::new(AttemptRunner::new(ExecutorServices {
        store,
        clients: Arc::new(clients),
        launcher: launcher.clone(),
        http,
        execution: settings.execution.clone(),
    }));
    launcher.attach_runner(&runner);

    info!("Executors initialized");

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, cancelling step execution");
                on_interrupt.cancel_by(CONSOLE_ACTOR);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let ctx = OrchestrationContext::root(step.execution_id);
    let attempts = runner.run_step(&step, &ctx, &cancel).await;

    // Job steps that do not wait still own running child executions
    if launcher.active_executions() > 0 {
        info!(
            executions = launcher.active_executions(),
            "Waiting for child job executions to finish"
        );
        launcher.wait_all(&cancel).await;
    }

    println!("{}", serde_json::to_string_pretty(&attempts)?);

    let result = attempts.last().and_then(|attempt| attempt.result);
    info!(attempts = attempts.len(), result = ?result, "Step execution finished");
    telemetry::shutdown_tracer();

    Ok(match result {
        Some(StepOutcome::Success) => ExitCode::SUCCESS,
        Some(StepOutcome::Cancel) => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

fn read_step(path: &Path) -> Result<StepExecution> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to read step document");
        anyhow::anyhow!("Failed to read {}: {}", path.display(), e)
    })?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid step document {}: {}", path.display(), e))
}

async fn open_store(settings: &Settings, migrate: bool) -> Result<Arc<dyn AttemptStore>> {
    if settings.database.url.is_empty() {
        warn!("No database configured, attempts are kept in memory");
        return Ok(Arc::new(MemoryAttemptStore::new()));
    }

    let pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        anyhow::anyhow!("Database initialization error: {}", e)
    })?;
    if migrate {
        pool.run_migrations()
            .await
            .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    }
    pool.health_check()
        .await
        .map_err(|e| anyhow::anyhow!("Database health check failed: {}", e))?;

    info!("Database pool initialized");
    Ok(Arc::new(PgAttemptStore::new(pool)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_arguments() {
        let cli = Cli::parse_from([
            "worker",
            "--step",
            "step.json",
            "--jobs",
            "jobs.json",
            "--migrate",
        ]);
        assert_eq!(cli.config_dir, PathBuf::from("config"));
        assert_eq!(cli.step, PathBuf::from("step.json"));
        assert_eq!(cli.jobs, Some(PathBuf::from("jobs.json")));
        assert!(cli.migrate);
    }

    #[test]
    fn test_read_step_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "execution_id": "6f1c3a52-1d7e-4f0e-9a39-7a4f6d1f1b10",
                "step_id": "0e8f7c1a-2b3d-4e5f-8a9b-0c1d2e3f4a5b",
                "step_name": "refresh",
                "retry_attempts": 2,
                "config": {{"type": "databricks", "workspace_id": "analytics", "job_id": 42}}
            }}"#
        )
        .unwrap();

        let step = read_step(&path).unwrap();
        assert_eq!(step.step_name, "refresh");
        assert_eq!(step.retry_attempts, 2);
        assert!(step.timeout().unwrap().is_none());

        assert!(read_step(&dir.path().join("missing.json")).is_err());
    }
}

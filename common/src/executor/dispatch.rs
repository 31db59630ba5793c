// Step type to executor dispatch

use std::sync::Arc;
use std::time::Duration;

use super::attempt::AttemptRecorder;
use super::databricks::DatabricksJobRun;
use super::dbt::DbtJobRun;
use super::exe::protocol::StartExeRequest;
use super::exe::{process_spec, split_arguments, ExeExecutor, ExeProxyClient, ProxyExeExecutor};
use super::fabric::FabricItemJob;
use super::function::FunctionCall;
use super::http::{resolve_request, HttpTriggerExecutor};
use super::job::JobStepExecutor;
use super::pipeline::PipelineRun;
use super::poll::{PollSettings, RemoteOperation};
use super::powerbi::{DataflowRefresh, DatasetRefresh};
use super::qlik::{QlikAutomationRun, QlikReload};
use super::sql::SqlExecutor;
use super::{ExecutorServices, PollingExecutor, StepExecutor};
use crate::errors::ExecutionError;
use crate::models::{ExeStepConfig, FunctionStepConfig, StepConfig, StepExecution};
use crate::parameters::ParameterSubstitutor;

fn polling<O>(
    operation: O,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
    settings: PollSettings,
) -> Box<dyn StepExecutor>
where
    O: RemoteOperation + 'static,
{
    Box::new(PollingExecutor::new(operation, recorder, timeout, settings))
}

/// Build the executor of a step attempt.
///
/// Parameters are substituted and backend clients resolved here, so
/// configuration errors surface before anything is sent to a backend.
pub fn build_executor(
    step: &StepExecution,
    recorder: Arc<AttemptRecorder>,
    services: &ExecutorServices,
) -> Result<Box<dyn StepExecutor>, ExecutionError> {
    let parameters = ParameterSubstitutor::new(&step.parameters)?;
    let timeout = step.timeout()?;
    let settings = services.poll_settings();
    let clients = &services.clients;

    let executor: Box<dyn StepExecutor> = match &step.config {
        StepConfig::Sql(config) => {
            let url = clients
                .sql_connection(&config.connection_id)
                .ok_or_else(|| ExecutionError::missing_client("SQL connection", &config.connection_id))?;
            Box::new(SqlExecutor::new(
                url,
                parameters.substitute(&config.statement)?,
                config.capture_result,
                recorder,
                timeout,
            ))
        }
        StepConfig::HttpTrigger(config) => Box::new(HttpTriggerExecutor::new(
            services.http.clone(),
            resolve_request(config, &parameters)?,
            recorder,
            timeout,
        )),
        StepConfig::Function(config) => {
            let resolved = FunctionStepConfig {
                url: parameters.substitute(&config.url)?,
                body: parameters.substitute_opt(config.body.as_deref())?,
                ..config.clone()
            };
            polling(
                FunctionCall::new(services.http.clone(), resolved),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::Pipeline(config) => {
            let client = clients
                .pipeline(&config.client_id)
                .ok_or_else(|| ExecutionError::missing_client("pipeline client", &config.client_id))?;
            polling(
                PipelineRun::new(
                    client,
                    parameters.substitute(&config.pipeline_name)?,
                    parameters.values().clone(),
                ),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::Databricks(config) => {
            let client = clients.databricks(&config.workspace_id).ok_or_else(|| {
                ExecutionError::missing_client("Databricks workspace", &config.workspace_id)
            })?;
            polling(
                DatabricksJobRun::new(client, config.job_id, parameters.values().clone()),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::DbtCloud(config) => {
            let client = clients.dbt(&config.account_id).ok_or_else(|| {
                ExecutionError::missing_client("dbt Cloud account", &config.account_id)
            })?;
            polling(
                DbtJobRun::new(client, config.job_id, &step.step_name),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::PowerBiDatasetRefresh(config) => {
            let client = clients.power_bi(&config.credential_id).ok_or_else(|| {
                ExecutionError::missing_client("Power BI credential", &config.credential_id)
            })?;
            polling(
                DatasetRefresh::new(client, config.workspace_id.clone(), config.dataset_id.clone()),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::PowerBiDataflowRefresh(config) => {
            let client = clients.power_bi(&config.credential_id).ok_or_else(|| {
                ExecutionError::missing_client("Power BI credential", &config.credential_id)
            })?;
            polling(
                DataflowRefresh::new(
                    client,
                    config.workspace_id.clone(),
                    config.dataflow_id.clone(),
                ),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::FabricItemJob(config) => {
            let client = clients.fabric(&config.credential_id).ok_or_else(|| {
                ExecutionError::missing_client("Fabric credential", &config.credential_id)
            })?;
            polling(
                FabricItemJob::new(
                    client,
                    config.workspace_id.clone(),
                    config.item_id.clone(),
                    config.job_type.clone(),
                    parameters.values().clone(),
                ),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::QlikReload(config) => {
            let client = clients.qlik(&config.environment_id).ok_or_else(|| {
                ExecutionError::missing_client("Qlik environment", &config.environment_id)
            })?;
            polling(
                QlikReload::new(client, config.app_id.clone(), config.partial),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::QlikAutomation(config) => {
            let client = clients.qlik(&config.environment_id).ok_or_else(|| {
                ExecutionError::missing_client("Qlik environment", &config.environment_id)
            })?;
            polling(
                QlikAutomationRun::new(client, config.automation_id.clone()),
                recorder,
                timeout,
                settings,
            )
        }
        StepConfig::Exe(config) => build_exe(config, &parameters, recorder, timeout, services)?,
        StepConfig::Job(config) => Box::new(JobStepExecutor::new(
            Arc::clone(&services.launcher),
            Arc::clone(&services.store),
            config.job_to_execute_id,
            config.synchronized,
            step.parameters.clone(),
            config.filter_step_tags.clone(),
            recorder,
            timeout,
        )),
    };
    Ok(executor)
}

fn build_exe(
    config: &ExeStepConfig,
    parameters: &ParameterSubstitutor,
    recorder: Arc<AttemptRecorder>,
    timeout: Option<Duration>,
    services: &ExecutorServices,
) -> Result<Box<dyn StepExecutor>, ExecutionError> {
    let file_path = parameters.substitute(&config.file_path)?;
    let arguments = parameters.substitute_opt(config.arguments.as_deref())?;
    let working_directory = parameters.substitute_opt(config.working_directory.as_deref())?;

    let Some(proxy_id) = &config.proxy_id else {
        let spec = process_spec(file_path, arguments.as_deref(), working_directory, config.run_as)?;
        return Ok(Box::new(ExeExecutor::new(
            spec,
            config.success_exit_code,
            recorder,
            timeout,
            services.publish_schedule(),
        )));
    };

    if config.run_as.is_some() {
        return Err(ExecutionError::InvalidStepConfiguration(
            "Alternate credentials are not supported for proxied executables".to_string(),
        ));
    }
    let proxy = services
        .clients
        .exe_proxy(proxy_id)
        .ok_or_else(|| ExecutionError::missing_client("execution proxy", proxy_id))?;
    let request = StartExeRequest {
        exe_path: file_path,
        arguments: arguments.as_deref().map(split_arguments).unwrap_or_default(),
        working_directory,
    };
    Ok(Box::new(ProxyExeExecutor::new(
        ExeProxyClient::new(services.http.clone(), &proxy),
        request,
        config.success_exit_code,
        recorder,
        timeout,
        services.poll_settings(),
        services.publish_schedule(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::executor::clients::ConfiguredClients;
    use crate::executor::job::{ChildExecutionRequest, JobLauncher};
    use crate::models::{
        DatabricksStepConfig, OrchestrationContext, SqlStepConfig, StepExecutionAttempt,
        StepParameter,
    };
    use crate::storage::{AttemptStore, MemoryAttemptStore};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NoLauncher;

    #[async_trait]
    impl JobLauncher for NoLauncher {
        async fn create_execution(
            &self,
            _request: &ChildExecutionRequest,
        ) -> Result<Uuid, ExecutionError> {
            Err(ExecutionError::JobLaunchFailed("not available".to_string()))
        }
        async fn start_execution(
            &self,
            _execution_id: Uuid,
            _ctx: &OrchestrationContext,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn wait_for_completion(&self, _execution_id: Uuid) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn cancel_execution(
            &self,
            _execution_id: Uuid,
            _requested_by: &str,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn services(clients: ConfiguredClients) -> ExecutorServices {
        ExecutorServices {
            store: Arc::new(MemoryAttemptStore::new()),
            clients: Arc::new(clients),
            launcher: Arc::new(NoLauncher),
            http: reqwest::Client::new(),
            execution: ExecutionConfig::default(),
        }
    }

    fn step(config: StepConfig, parameters: Vec<StepParameter>) -> StepExecution {
        StepExecution {
            execution_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            step_name: "step".to_string(),
            timeout_minutes: 0.0,
            retry_attempts: 0,
            retry_interval_minutes: 0.0,
            parameters,
            config,
        }
    }

    fn recorder(step: &StepExecution, store: Arc<dyn AttemptStore>) -> Arc<AttemptRecorder> {
        Arc::new(AttemptRecorder::new(StepExecutionAttempt::new(step, 0), store))
    }

    #[test]
    fn test_missing_backend_client_fails_fast() {
        let services = services(ConfiguredClients::new());
        let step = step(
            StepConfig::Databricks(DatabricksStepConfig {
                workspace_id: "ws-1".to_string(),
                job_id: 7,
            }),
            Vec::new(),
        );
        let err = build_executor(&step, recorder(&step, services.store.clone()), &services)
            .err()
            .unwrap();
        assert_eq!(err, ExecutionError::missing_client("Databricks workspace", "ws-1"));
    }

    #[test]
    fn test_undefined_parameter_fails_fast() {
        let services = services(
            ConfiguredClients::new().with_sql_connection("dw", "postgresql://localhost/dw"),
        );
        let step = step(
            StepConfig::Sql(SqlStepConfig {
                connection_id: "dw".to_string(),
                statement: "CALL load(${LoadDate})".to_string(),
                capture_result: false,
            }),
            Vec::new(),
        );
        let err = build_executor(&step, recorder(&step, services.store.clone()), &services)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::ParameterResolutionFailed(_)));
    }

    #[test]
    fn test_configured_step_builds() {
        let services = services(
            ConfiguredClients::new().with_sql_connection("dw", "postgresql://localhost/dw"),
        );
        let step = step(
            StepConfig::Sql(SqlStepConfig {
                connection_id: "dw".to_string(),
                statement: "CALL load('${LoadDate}')".to_string(),
                capture_result: false,
            }),
            vec![StepParameter {
                name: "LoadDate".to_string(),
                value: serde_json::json!("2024-01-31"),
            }],
        );
        assert!(build_executor(&step, recorder(&step, services.store.clone()), &services).is_ok());
    }
}

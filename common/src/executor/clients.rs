// Backend client registry resolved by adapters at construction

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use super::databricks::{DatabricksClient, HttpDatabricksClient};
use super::dbt::{DbtClient, HttpDbtClient};
use super::fabric::FabricClient;
use super::pipeline::PipelineClient;
use super::powerbi::PowerBiClient;
use super::qlik::QlikClient;
use crate::config::ConnectionsConfig;
use crate::models::ExeProxy;

/// Read a JSON response body, turning non-success statuses into errors
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, String> {
    let status = response.status();
    let body = response.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("HTTP {}: {}", status.as_u16(), body));
    }
    let body = if body.trim().is_empty() { "null" } else { body.as_str() };
    serde_json::from_str(body).map_err(|e| format!("invalid response body: {}", e))
}

/// ClientProvider resolves backend clients by the id referenced in a step
pub trait ClientProvider: Send + Sync {
    /// Connection string of a named SQL connection
    fn sql_connection(&self, connection_id: &str) -> Option<String>;

    fn databricks(&self, workspace_id: &str) -> Option<Arc<dyn DatabricksClient>>;

    fn dbt(&self, account_id: &str) -> Option<Arc<dyn DbtClient>>;

    fn pipeline(&self, client_id: &str) -> Option<Arc<dyn PipelineClient>>;

    fn power_bi(&self, credential_id: &str) -> Option<Arc<dyn PowerBiClient>>;

    fn fabric(&self, credential_id: &str) -> Option<Arc<dyn FabricClient>>;

    fn qlik(&self, environment_id: &str) -> Option<Arc<dyn QlikClient>>;

    fn exe_proxy(&self, proxy_id: &str) -> Option<ExeProxy>;
}

/// In-memory client registry built from configuration.
///
/// Databricks and dbt Cloud clients are created from `[connections]`;
/// the remaining backends are registered by the embedding application.
#[derive(Default, Clone)]
pub struct ConfiguredClients {
    sql: HashMap<String, String>,
    databricks: HashMap<String, Arc<dyn DatabricksClient>>,
    dbt: HashMap<String, Arc<dyn DbtClient>>,
    pipelines: HashMap<String, Arc<dyn PipelineClient>>,
    power_bi: HashMap<String, Arc<dyn PowerBiClient>>,
    fabric: HashMap<String, Arc<dyn FabricClient>>,
    qlik: HashMap<String, Arc<dyn QlikClient>>,
    proxies: HashMap<String, ExeProxy>,
}

impl ConfiguredClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(connections: &ConnectionsConfig, http: reqwest::Client) -> Self {
        let mut clients = Self::new();
        for (id, sql) in &connections.sql {
            clients.sql.insert(id.clone(), sql.url.clone());
        }
        for (id, workspace) in &connections.databricks {
            let client =
                HttpDatabricksClient::new(http.clone(), &workspace.host, &workspace.token);
            clients.databricks.insert(id.clone(), Arc::new(client));
        }
        for (id, account) in &connections.dbt {
            let client = HttpDbtClient::new(
                http.clone(),
                &account.base_url,
                account.account_id,
                &account.token,
            );
            clients.dbt.insert(id.clone(), Arc::new(client));
        }
        for (id, proxy) in &connections.proxies {
            clients.proxies.insert(
                id.clone(),
                ExeProxy {
                    id: id.clone(),
                    base_url: proxy.base_url.clone(),
                    api_key: proxy.api_key.clone(),
                },
            );
        }
        clients
    }

    pub fn with_sql_connection(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.sql.insert(id.into(), url.into());
        self
    }

    pub fn with_databricks(
        mut self,
        id: impl Into<String>,
        client: Arc<dyn DatabricksClient>,
    ) -> Self {
        self.databricks.insert(id.into(), client);
        self
    }

    pub fn with_dbt(mut self, id: impl Into<String>, client: Arc<dyn DbtClient>) -> Self {
        self.dbt.insert(id.into(), client);
        self
    }

    pub fn with_pipeline(mut self, id: impl Into<String>, client: Arc<dyn PipelineClient>) -> Self {
        self.pipelines.insert(id.into(), client);
        self
    }

    pub fn with_power_bi(mut self, id: impl Into<String>, client: Arc<dyn PowerBiClient>) -> Self {
        self.power_bi.insert(id.into(), client);
        self
    }

    pub fn with_fabric(mut self, id: impl Into<String>, client: Arc<dyn FabricClient>) -> Self {
        self.fabric.insert(id.into(), client);
        self
    }

    pub fn with_qlik(mut self, id: impl Into<String>, client: Arc<dyn QlikClient>) -> Self {
        self.qlik.insert(id.into(), client);
        self
    }

    pub fn with_exe_proxy(mut self, proxy: ExeProxy) -> Self {
        self.proxies.insert(proxy.id.clone(), proxy);
        self
    }
}

impl ClientProvider for ConfiguredClients {
    fn sql_connection(&self, connection_id: &str) -> Option<String> {
        self.sql.get(connection_id).cloned()
    }

    fn databricks(&self, workspace_id: &str) -> Option<Arc<dyn DatabricksClient>> {
        self.databricks.get(workspace_id).cloned()
    }

    fn dbt(&self, account_id: &str) -> Option<Arc<dyn DbtClient>> {
        self.dbt.get(account_id).cloned()
    }

    fn pipeline(&self, client_id: &str) -> Option<Arc<dyn PipelineClient>> {
        self.pipelines.get(client_id).cloned()
    }

    fn power_bi(&self, credential_id: &str) -> Option<Arc<dyn PowerBiClient>> {
        self.power_bi.get(credential_id).cloned()
    }

    fn fabric(&self, credential_id: &str) -> Option<Arc<dyn FabricClient>> {
        self.fabric.get(credential_id).cloned()
    }

    fn qlik(&self, environment_id: &str) -> Option<Arc<dyn QlikClient>> {
        self.qlik.get(environment_id).cloned()
    }

    fn exe_proxy(&self, proxy_id: &str) -> Option<ExeProxy> {
        self.proxies.get(proxy_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DatabricksWorkspaceConfig, ProxyConnectionConfig, SqlConnectionConfig,
    };

    #[test]
    fn test_from_settings_registers_configured_connections() {
        let mut connections = ConnectionsConfig::default();
        connections.sql.insert(
            "warehouse".to_string(),
            SqlConnectionConfig {
                url: "postgresql://localhost/warehouse".to_string(),
            },
        );
        connections.databricks.insert(
            "ws-1".to_string(),
            DatabricksWorkspaceConfig {
                host: "https://adb.example.net".to_string(),
                token: "dapi".to_string(),
            },
        );
        connections.proxies.insert(
            "build-box".to_string(),
            ProxyConnectionConfig {
                base_url: "http://build-box:8090".to_string(),
                api_key: None,
            },
        );

        let clients = ConfiguredClients::from_settings(&connections, reqwest::Client::new());

        assert_eq!(
            clients.sql_connection("warehouse").as_deref(),
            Some("postgresql://localhost/warehouse")
        );
        assert!(clients.databricks("ws-1").is_some());
        assert!(clients.databricks("ws-2").is_none());
        assert!(clients.dbt("any").is_none());
        let proxy = clients.exe_proxy("build-box").unwrap();
        assert_eq!(proxy.id, "build-box");
        assert_eq!(proxy.base_url, "http://build-box:8090");
    }
}

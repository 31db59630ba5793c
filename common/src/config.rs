// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub connections: ConnectionsConfig,
    #[serde(default)]
    pub exe_proxy: ExeProxyServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Attempt store database. Empty keeps attempts in memory.
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Delay between status polls of remote operations
    pub polling_interval_ms: u64,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 5000,
            publisher: PublisherConfig::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub initial_interval_secs: u64,
    pub initial_ticks: u32,
    pub steady_interval_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            initial_interval_secs: 10,
            initial_ticks: 6,
            steady_interval_secs: 30,
        }
    }
}

/// Named backend connections referenced by step configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(default)]
    pub sql: HashMap<String, SqlConnectionConfig>,
    #[serde(default)]
    pub databricks: HashMap<String, DatabricksWorkspaceConfig>,
    #[serde(default)]
    pub dbt: HashMap<String, DbtAccountConfig>,
    #[serde(default)]
    pub proxies: HashMap<String, ProxyConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConnectionConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabricksWorkspaceConfig {
    pub host: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbtAccountConfig {
    pub base_url: String,
    pub account_id: i64,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConnectionConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Bind address and credentials of the exe proxy server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExeProxyServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ExeProxyServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if !self.database.url.is_empty() && self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.execution.polling_interval_ms == 0 {
            return Err("Execution polling_interval_ms must be greater than 0".to_string());
        }
        let publisher = &self.execution.publisher;
        if publisher.initial_interval_secs == 0 || publisher.steady_interval_secs == 0 {
            return Err("Publisher intervals must be greater than 0".to_string());
        }

        for (id, connection) in &self.connections.sql {
            if connection.url.is_empty() {
                return Err(format!("SQL connection '{}' has an empty URL", id));
            }
        }
        for (id, workspace) in &self.connections.databricks {
            if workspace.host.is_empty() {
                return Err(format!("Databricks workspace '{}' has an empty host", id));
            }
        }
        for (id, account) in &self.connections.dbt {
            if account.base_url.is_empty() {
                return Err(format!("dbt account '{}' has an empty base URL", id));
            }
        }
        for (id, proxy) in &self.connections.proxies {
            if proxy.base_url.is_empty() {
                return Err(format!("Execution proxy '{}' has an empty base URL", id));
            }
        }

        if self.exe_proxy.port == 0 {
            return Err("Exe proxy port must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(
            settings.execution.polling_interval(),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn test_validation_catches_zero_polling_interval() {
        let mut settings = Settings::default();
        settings.execution.polling_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_publisher_interval() {
        let mut settings = Settings::default();
        settings.execution.publisher.steady_interval_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_proxy_url() {
        let mut settings = Settings::default();
        settings.connections.proxies.insert(
            "remote".to_string(),
            ProxyConnectionConfig {
                base_url: String::new(),
                api_key: None,
            },
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_proxy_port() {
        let mut settings = Settings::default();
        settings.exe_proxy.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_path_reads_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[execution]
polling_interval_ms = 250

[connections.databricks.analytics]
host = "https://adb.example.net"
token = "dapi-123"
"#
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.execution.polling_interval_ms, 250);
        assert_eq!(settings.execution.publisher.initial_ticks, 6);
        assert_eq!(
            settings.connections.databricks["analytics"].host,
            "https://adb.example.net"
        );
    }
}

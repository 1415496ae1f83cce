use crate::payments::registry::ProviderConfig;
use crate::payments::types::Environment;
use crate::services::payment_orchestrator::OrchestratorConfig;
use crate::workers::payment_status_poller::PollerConfig;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` runs against the in-memory repository
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub poller: PollerConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let config = AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env_optional()?,
            logging: LoggingConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env(),
            poller: PollerConfig::from_env(),
            providers: providers_from_vars(env::vars())?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;

        if self.orchestrator.adapter_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_ADAPTER_TIMEOUT_SECS".to_string(),
            ));
        }
        if self.orchestrator.invoice_max_attempts == 0 {
            return Err(ConfigError::InvalidValue("INVOICE_MAX_ATTEMPTS".to_string()));
        }
        if !self.providers.iter().any(|p| p.enabled) {
            return Err(ConfigError::ValidationFailed(
                "at least one payment provider must be enabled".to_string(),
            ));
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        let Ok(url) = env::var("DATABASE_URL") else {
            return Ok(None);
        };

        Ok(Some(DatabaseConfig {
            url,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        }))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

/// Builds provider configs from `PAYMENT_PROVIDERS` plus `<NAME>_*` variables.
///
/// `<NAME>_ENABLED` and `<NAME>_ENVIRONMENT` are read as flags; every other
/// `<NAME>_<KEY>` lands in the credential map as lowercase `key`.
pub fn providers_from_vars(
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<Vec<ProviderConfig>, ConfigError> {
    let vars: HashMap<String, String> = vars.into_iter().collect();
    let names = vars
        .get("PAYMENT_PROVIDERS")
        .cloned()
        .unwrap_or_else(|| "midtrans".to_string());

    let mut providers = Vec::new();
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let name = name.to_lowercase();
        let prefix = format!("{}_", name.to_uppercase());

        let enabled_key = format!("{}ENABLED", prefix);
        let enabled = match vars.get(&enabled_key) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue(enabled_key.clone()))?,
            None => true,
        };

        let environment_key = format!("{}ENVIRONMENT", prefix);
        let environment = match vars.get(&environment_key) {
            Some(value) => Environment::from_str(value)
                .map_err(|_| ConfigError::InvalidValue(environment_key.clone()))?,
            None => Environment::default(),
        };

        let credentials = vars
            .iter()
            .filter(|(key, _)| *key != &enabled_key && *key != &environment_key)
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|rest| (rest.to_lowercase(), value.clone()))
            })
            .collect();

        providers.push(ProviderConfig {
            name,
            enabled,
            environment,
            credentials,
        });
    }

    Ok(providers)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::loader::DEFAULT_BATCH_SIZE;
use crate::service::ServiceConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    pub service: ServiceSection,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Log hit/miss counters when a command finishes.
    pub report_stats: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub operation_timeout_ms: Option<u64>,
    /// Principal that owns ACLs created by the admin tool.
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/hieracl".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HIERACL_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("HIERACL_DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("HIERACL_LOADER_BATCH_SIZE")
            && let Ok(n) = v.parse()
        {
            self.loader.batch_size = n;
        }
        if let Ok(v) = std::env::var("HIERACL_SERVICE_OPERATION_TIMEOUT_MS")
            && let Ok(ms) = v.parse()
        {
            self.service.operation_timeout_ms = Some(ms);
        }
        if let Ok(v) = std::env::var("HIERACL_SERVICE_PRINCIPAL") {
            self.service.principal = Some(v);
        }
        if let Ok(v) = std::env::var("HIERACL_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("HIERACL_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.loader.batch_size == 0 {
            return Err(ConfigError::Validation(
                "loader.batch_size must be non-zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        if self.service.operation_timeout_ms == Some(0) {
            return Err(ConfigError::Validation(
                "service.operation_timeout_ms must be non-zero when set".to_string(),
            ));
        }
        if self
            .service
            .principal
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "service.principal must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            batch_size: self.loader.batch_size,
            operation_timeout: self.service.operation_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_values() {
        let config = AppConfig::default();

        assert_eq!(config.loader.batch_size, 50);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(config.service.operation_timeout_ms.is_none());
        assert!(!config.cache.report_stats);
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgresql://db:5432/acl"

[loader]
batch_size = 20

[service]
operation_timeout_ms = 1500
principal = "admin"

[cache]
report_stats = true

[log]
format = "pretty"
level = "debug"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.database.url, "postgresql://db:5432/acl");
        assert_eq!(config.loader.batch_size, 20);
        assert_eq!(config.service.principal.as_deref(), Some("admin"));
        assert!(config.cache.report_stats);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.log.level, "debug");

        let service = config.to_service_config();
        assert_eq!(service.batch_size, 20);
        assert_eq!(service.operation_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn env_vars_override_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[loader]
batch_size = 20
"#
        )
        .unwrap();

        // SAFETY: no other test reads this variable
        unsafe { std::env::set_var("HIERACL_LOADER_BATCH_SIZE", "75") };
        let config = AppConfig::load(Some(&path)).unwrap();
        unsafe { std::env::remove_var("HIERACL_LOADER_BATCH_SIZE") };

        assert_eq!(config.loader.batch_size, 75);
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let result = AppConfig::load(Some(&path));

        assert!(matches!(result, Err(ConfigError::ReadFile(..))));
    }

    #[test]
    fn validation_rejects_zero_batch_size() {
        let mut config = AppConfig::default();
        config.loader.batch_size = 0;

        let result = config.validate();
        assert!(
            matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("batch_size"))
        );
    }

    #[test]
    fn validation_rejects_zero_timeout() {
        let mut config = AppConfig::default();
        config.service.operation_timeout_ms = Some(0);

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(ref msg)) if msg.contains("timeout")));
    }
}

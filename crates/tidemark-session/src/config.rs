//! Configuration loading and typed config structures for the session
//! factory.
//!
//! The canonical configuration is a YAML file; this module defines
//! strongly-typed structs mirroring it, with field-by-field defaults so a
//! partial file (or none at all) still yields a working configuration.
//! Environment variables override file values for deployment secrets.

use std::path::Path;

use serde::Deserialize;

use tidemark_driver::PostgresConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Which of the two calling conventions an application works with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiConvention {
    /// Operations resolve through single-completion futures.
    #[default]
    Deferred,
    /// Operations resolve through streams.
    Streaming,
}

/// Top-level factory configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FactoryConfig {
    /// Database connection and pool settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Session-level settings.
    #[serde(default)]
    pub session: SessionConfig,
}

impl FactoryConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `DATABASE_URL` overrides `database.url`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.database.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.database.apply_env_overrides();
        Ok(config)
    }
}

/// Database connection and pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Bounded wait-queue capacity beyond the pool size; requests past it
    /// fail fast.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: u32,
    /// Connection-acquisition timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_url() -> String {
    "postgresql://localhost:5432/postgres".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_queue_capacity() -> u32 {
    32
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

const fn default_idle_timeout_secs() -> u64 {
    300
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: default_max_connections(),
            queue_capacity: default_queue_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Replace file values with environment overrides, when present.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.url = url;
            }
        }
    }

    /// Convert into the driver's pool configuration.
    pub fn to_postgres_config(&self) -> PostgresConfig {
        PostgresConfig::new(&self.url)
            .with_max_connections(self.max_connections)
            .with_queue_capacity(self.queue_capacity)
            .with_connect_timeout(std::time::Duration::from_secs(self.connect_timeout_secs))
            .with_idle_timeout(std::time::Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Session-level settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// The calling convention the application selected. Both conventions
    /// are always available; this records the deployment's choice and is
    /// what [`SessionFactory::convention`] reports.
    ///
    /// [`SessionFactory::convention`]: crate::factory::SessionFactory::convention
    #[serde(default)]
    pub api: ApiConvention,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = FactoryConfig::parse("{}").unwrap();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.session.api, ApiConvention::Deferred);
    }

    #[test]
    fn partial_yaml_overrides_selected_fields() {
        let yaml = r"
database:
  max_connections: 3
session:
  api: streaming
";
        let config = FactoryConfig::parse(yaml).unwrap();
        assert_eq!(config.database.max_connections, 3);
        assert_eq!(config.database.queue_capacity, 32);
        assert_eq!(config.session.api, ApiConvention::Streaming);
    }

    #[test]
    fn converts_to_driver_config() {
        let config = DatabaseConfig::default();
        let pg = config.to_postgres_config();
        assert_eq!(pg.max_connections, 10);
        assert_eq!(pg.queue_capacity, 32);
    }
}

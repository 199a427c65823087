//! Configuration loading and environment variable handling

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use graft_core::MessageFormat;

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::session::SessionConfig;
use crate::domains::GraftConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "GRAFT".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<GraftConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: GraftConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<GraftConfig> {
        let mut config = GraftConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<GraftConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut GraftConfig) -> ConfigResult<()> {
        self.apply_session_overrides(&mut config.session)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply session config overrides
    fn apply_session_overrides(&self, config: &mut SessionConfig) -> ConfigResult<()> {
        if let Ok(executable) = self.get_env_var("EXECUTABLE") {
            config.executable = executable;
        }

        if let Ok(format) = self.get_env_var("MESSAGE_FORMAT") {
            config.message_format = MessageFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid MESSAGE_FORMAT: {}", format)))?;
        }

        if let Ok(host) = self.get_env_var("HOST") {
            config.host = Some(host).filter(|h| !h.is_empty());
        }

        if let Ok(user) = self.get_env_var("USER") {
            config.user = Some(user).filter(|u| !u.is_empty());
        }

        if let Ok(shell) = self.get_env_var("REMOTE_SHELL") {
            config.remote_shell = shell;
        }

        if let Ok(echo) = self.get_env_var("ECHO_OUTPUT") {
            config.echo_output = echo
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid ECHO_OUTPUT: {}", e)))?;
        }

        if let Ok(forward) = self.get_env_var("FORWARD_INTERRUPTS") {
            config.forward_interrupts = forward
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid FORWARD_INTERRUPTS: {}", e)))?;
        }

        if let Some(interval) = self.get_env_millis("POLL_INTERVAL_MS")? {
            config.poll_interval = interval;
        }

        if let Some(timeout) = self.get_env_millis("CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = timeout;
        }

        if let Some(timeout) = self.get_env_millis("SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = timeout;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn get_env_millis(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let millis: u64 = value
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(Duration::from_millis(millis)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

//! Session configuration: how the remote engine is launched and talked to

use std::time::Duration;

use graft_core::MessageFormat;
use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};

/// Placeholder in `arguments` replaced by the message format name
pub const FORMAT_PLACEHOLDER: &str = "{format}";

/// Placeholder in `arguments` replaced by the endpoint the remote connects to
pub const ADDRESS_PLACEHOLDER: &str = "{address}";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote engine executable
    pub executable: String,

    /// Arguments, with `{format}` and `{address}` substituted at launch
    pub arguments: Vec<String>,

    /// Wire encoding
    pub message_format: MessageFormat,

    /// Launch on this host through `remote_shell` instead of locally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Login name for the remote host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Program used to reach `host`
    pub remote_shell: String,

    /// Forward the remote's standard output to the local console
    #[serde(default = "crate::domains::utils::default_true")]
    pub echo_output: bool,

    /// Longest wait between liveness checks of the remote process
    #[serde(with = "crate::domains::utils::serde_duration_ms")]
    pub poll_interval: Duration,

    /// How long the remote may take to connect back
    #[serde(with = "crate::domains::utils::serde_duration_ms")]
    pub connect_timeout: Duration,

    /// How long to wait for exit after `die` before killing
    #[serde(with = "crate::domains::utils::serde_duration_ms")]
    pub shutdown_timeout: Duration,

    /// Function called once at startup to confirm the remote is ready
    pub handshake_function: String,

    /// Argument passed to `handshake_function`
    pub handshake_argument: String,

    /// Forward Ctrl-C to a remote call in progress
    #[serde(default = "crate::domains::utils::default_true")]
    pub forward_interrupts: bool,

    /// Frames in files with these extensions get their source line in traces
    pub source_extensions: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: "graft".to_string(),
            arguments: vec![
                "remote".to_string(),
                "--format".to_string(),
                FORMAT_PLACEHOLDER.to_string(),
                "--address".to_string(),
                ADDRESS_PLACEHOLDER.to_string(),
            ],
            message_format: MessageFormat::Cbor,
            host: None,
            user: None,
            remote_shell: "ssh".to_string(),
            echo_output: true,
            poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            handshake_function: "eval".to_string(),
            handshake_argument: "0;".to_string(),
            forward_interrupts: true,
            source_extensions: vec!["rs".to_string()],
        }
    }
}

impl SessionConfig {
    /// Arguments with the placeholders filled in
    pub fn expand_arguments(&self, address: &str) -> Vec<String> {
        self.arguments
            .iter()
            .map(|arg| {
                arg.replace(FORMAT_PLACEHOLDER, self.message_format.name())
                    .replace(ADDRESS_PLACEHOLDER, address)
            })
            .collect()
    }

    /// `user@host`, or just `host`, when launching remotely
    pub fn remote_target(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match self.user.as_deref() {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        })
    }
}

impl Validatable for SessionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.executable, "executable", self.domain_name())?;
        validate_required_string(
            &self.handshake_function,
            "handshake_function",
            self.domain_name(),
        )?;
        validate_positive(
            self.poll_interval.as_millis(),
            "poll_interval",
            self.domain_name(),
        )?;
        validate_positive(
            self.connect_timeout.as_millis(),
            "connect_timeout",
            self.domain_name(),
        )?;

        if !self.arguments.iter().any(|arg| arg.contains(ADDRESS_PLACEHOLDER)) {
            return Err(self.validation_error(format!(
                "arguments must contain {} so the remote knows where to connect",
                ADDRESS_PLACEHOLDER
            )));
        }

        if let Some(host) = &self.host {
            validate_required_string(host, "host", self.domain_name())?;
            validate_required_string(&self.remote_shell, "remote_shell", self.domain_name())?;
        }

        if self.user.is_some() && self.host.is_none() {
            return Err(self.validation_error("user is only meaningful together with host"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "session"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.executable, "graft");
        assert_eq!(config.message_format, MessageFormat::Cbor);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.handshake_argument, "0;");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_arguments() {
        let config = SessionConfig {
            message_format: MessageFormat::Json,
            ..Default::default()
        };
        assert_eq!(
            config.expand_arguments("tcp://127.0.0.1:4000"),
            vec!["remote", "--format", "json", "--address", "tcp://127.0.0.1:4000"]
        );
    }

    #[test]
    fn test_remote_target() {
        let mut config = SessionConfig::default();
        assert_eq!(config.remote_target(), None);
        config.host = Some("cluster".to_string());
        assert_eq!(config.remote_target().as_deref(), Some("cluster"));
        config.user = Some("ana".to_string());
        assert_eq!(config.remote_target().as_deref(), Some("ana@cluster"));
    }

    #[test]
    fn test_session_config_validation() {
        let mut config = SessionConfig::default();
        config.arguments = vec!["remote".to_string()];
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.user = Some("ana".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: SessionConfig =
            serde_yaml::from_str("message_format: json\npoll_interval: 20\n").unwrap();
        assert_eq!(config.message_format, MessageFormat::Json);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.executable, "graft");
    }
}

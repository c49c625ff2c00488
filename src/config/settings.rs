//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::framing::DEFAULT_MAX_LINE_BYTES;
use crate::mcp::protocol::{PROTOCOL_VERSION, SERVER_NAME};
use crate::mcp::session::major_version;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Server identity and advertisement.
    #[serde(default)]
    pub server: ServerConfig,

    /// Transport selection.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Timeouts and size limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Where the stdio credential comes from.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError {
                message: message.into(),
            })
        }

        if self.server.name.trim().is_empty() {
            return invalid("server.name must not be empty");
        }
        if major_version(&self.server.protocol_version).is_empty() {
            return invalid("server.protocol_version must not be empty");
        }
        if self.transport.bind.parse::<SocketAddr>().is_err() {
            return invalid(format!(
                "Invalid transport.bind address '{}'",
                self.transport.bind
            ));
        }
        if self.transport.event_buffer == 0 {
            return invalid("transport.event_buffer must be greater than zero");
        }
        if self.transport.max_sessions == 0 {
            return invalid("transport.max_sessions must be greater than zero");
        }
        if self.limits.request_timeout_ms == 0 {
            return invalid("limits.request_timeout_ms must be greater than zero");
        }
        if self.limits.reply_timeout_ms == 0 {
            return invalid("limits.reply_timeout_ms must be greater than zero");
        }
        if self.limits.max_line_bytes == 0 {
            return invalid("limits.max_line_bytes must be greater than zero");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return invalid(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        Ok(())
    }
}

/// Server identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Name reported in `serverInfo`.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Protocol version spoken. Clients must share the major version.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Usage hints returned from `initialize`.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Advertise `listChanged` and send change notifications.
    #[serde(default = "default_true")]
    pub list_changed: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            protocol_version: default_protocol_version(),
            instructions: None,
            list_changed: true,
        }
    }
}

fn default_server_name() -> String {
    SERVER_NAME.to_string()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

const fn default_true() -> bool {
    true
}

/// Which transport the binary serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Newline-delimited JSON on stdin/stdout.
    #[default]
    Stdio,
    /// HTTP POST plus Server-Sent Events.
    Http,
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,

    /// Listen address for the HTTP transport.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Unacknowledged events kept per HTTP session.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Maximum concurrent HTTP sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            bind: default_bind(),
            event_buffer: default_event_buffer(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8808".to_string()
}

const fn default_event_buffer() -> usize {
    1024
}

const fn default_max_sessions() -> usize {
    100
}

/// Timeouts and size limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Deadline for requests the server sends.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long an HTTP POST waits for its reply before answering 202.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Longest accepted line on the stdio transport.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl LimitsConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_reply_timeout_ms() -> u64 {
    30_000
}

const fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

/// Credential source for stdio sessions. HTTP sessions use the
/// `Authorization` header instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Environment variable holding the credential.
    #[serde(default = "default_credential_env")]
    pub env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env: default_credential_env(),
        }
    }
}

fn default_credential_env() -> String {
    "MCP_CREDENTIAL".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.mode, TransportMode::Stdio);
        assert_eq!(config.server.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "server": {
                "name": "campaigns",
                "protocol_version": "1.2",
                "instructions": "Use list_campaigns first",
                "list_changed": false
            },
            "transport": {
                "mode": "http",
                "bind": "0.0.0.0:9000",
                "event_buffer": 64,
                "max_sessions": 4
            },
            "limits": {
                "request_timeout_ms": 2000,
                "reply_timeout_ms": 500,
                "max_line_bytes": 65536
            },
            "credentials": {
                "env": "CAMPAIGN_API_KEY"
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.name, "campaigns");
        assert!(!config.server.list_changed);
        assert_eq!(config.transport.mode, TransportMode::Http);
        assert_eq!(config.transport.max_sessions, 4);
        assert_eq!(config.limits.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.limits.reply_timeout(), Duration::from_millis(500));
        assert_eq!(config.credentials.env, "CAMPAIGN_API_KEY");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn limits_defaults() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.request_timeout_ms, 30_000);
        assert_eq!(limits.max_line_bytes, DEFAULT_MAX_LINE_BYTES);
    }

    #[test]
    fn logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
    }

    #[test]
    fn reject_zero_limits() {
        let json = r#"{ "limits": { "request_timeout_ms": 0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_empty_name() {
        let json = r#"{ "server": { "name": "  " } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_bad_bind_address() {
        let json = r#"{ "transport": { "bind": "localhost" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_mode() {
        let json = r#"{ "transport": { "mode": "websocket" } }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn reject_unknown_log_level() {
        let json = r#"{ "logging": { "level": "loud" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}

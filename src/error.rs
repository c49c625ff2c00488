//! Error types for mcp-runtime configuration and startup.
//!
//! # Security Note
//!
//! Error messages never include credential values. Variants that could
//! carry sensitive data use generic descriptions instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::mcp::registry::RegistryError;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors that stop the server from starting or keep it from running.
#[derive(Error, Debug)]
pub enum ServeError {
    /// The sample provider could not be registered.
    #[error("failed to register the campaign provider")]
    Registration(#[from] RegistryError),

    /// The HTTP listener could not be bound.
    #[error("failed to bind HTTP listener on {addr}")]
    Bind {
        /// Address from the command line or configuration.
        addr: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The transport failed while serving.
    #[error("transport failed")]
    Transport(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/etc/mcp-runtime/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "limits.request_timeout_ms must be greater than zero".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("request_timeout_ms"));
    }

    #[test]
    fn parse_error_keeps_source() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = ConfigError::ParseError {
            path: PathBuf::from("config.json"),
            source,
        };
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn bind_error_names_the_address() {
        let error = ServeError::Bind {
            addr: "127.0.0.1:8808".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(error.to_string().contains("127.0.0.1:8808"));
        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "in use");
    }

    #[test]
    fn registration_error_converts() {
        let error: ServeError = RegistryError::Duplicate {
            kind: "tool",
            name: "list_campaigns".to_string(),
        }
        .into();
        assert!(matches!(error, ServeError::Registration(_)));
        assert!(std::error::Error::source(&error)
            .unwrap()
            .to_string()
            .contains("list_campaigns"));
    }
}

//! Error types for sessions and transports.

use std::time::Duration;

use thiserror::Error;

use super::protocol::{JsonRpcErrorData, RequestId};
use super::session::SessionState;

/// Errors raised by a transport while moving frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Reading or writing the underlying stream failed.
    #[error("transport I/O failed")]
    Io(#[from] std::io::Error),

    /// An HTTP exchange failed before a status was received.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// The HTTP peer answered with a non-success status.
    #[error("HTTP peer answered {status}: {message}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// A message could not be serialised.
    #[error("failed to encode message")]
    Encode(#[from] serde_json::Error),

    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,
}

/// Errors surfaced to callers of the session API.
#[derive(Debug, Error)]
pub enum McpError {
    /// No reply arrived before the request's deadline.
    #[error("request {id} timed out after {after:?}")]
    TimedOut {
        /// The request that timed out.
        id: RequestId,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The request was cancelled locally.
    #[error("request {id} was cancelled")]
    Cancelled {
        /// The cancelled request.
        id: RequestId,
    },

    /// The session closed before a reply arrived.
    #[error("session is closed")]
    Closed,

    /// A caller-chosen ID collides with an outstanding request.
    #[error("request id {0} is already outstanding")]
    DuplicateId(RequestId),

    /// The session lifecycle does not allow this method yet.
    #[error("cannot send {method} while the session is {state}")]
    NotReady {
        /// The method that was refused.
        method: String,
        /// The lifecycle state at the time.
        state: SessionState,
    },

    /// The peer did not advertise the capability an operation requires.
    #[error("peer did not advertise support for {operation}")]
    NotAdvertised {
        /// The refused operation.
        operation: &'static str,
    },

    /// The peer replied with a JSON-RPC error.
    #[error("peer returned error {}: {}", .0.code, .0.message)]
    Remote(JsonRpcErrorData),

    /// The peer speaks an incompatible protocol version.
    #[error("protocol version {offered} is not compatible with {supported}")]
    UnsupportedVersion {
        /// The version offered by the peer.
        offered: String,
        /// The version spoken locally.
        supported: String,
    },

    /// A reply could not be decoded into the expected result type.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl McpError {
    /// Returns the JSON-RPC error code when the peer replied with an error.
    #[must_use]
    pub const fn remote_code(&self) -> Option<i32> {
        match self {
            Self::Remote(error) => Some(error.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::ErrorCode;

    #[test]
    fn remote_code_only_for_remote_errors() {
        let remote = McpError::Remote(JsonRpcErrorData::from_code(ErrorCode::MethodNotFound));
        assert_eq!(remote.remote_code(), Some(-32601));
        assert_eq!(McpError::Closed.remote_code(), None);
    }

    #[test]
    fn display_names_the_request() {
        let err = McpError::TimedOut {
            id: RequestId::Number(4),
            after: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "request 4 timed out after 2s");

        let err = McpError::NotReady {
            method: "tools/list".to_string(),
            state: SessionState::Initializing,
        };
        assert!(err.to_string().contains("initializing"));
    }
}

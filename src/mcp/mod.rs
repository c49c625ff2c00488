//! Model Context Protocol (MCP) implementation.
//!
//! Both ends of a session are built from the same parts; only the
//! [`peer::Service`] differs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          PeerHandle                          │
//! │                                                              │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │   │  Transport  │───▶│   reader    │───▶│   Service   │      │
//! │   │ stdio/HTTP  │    │ (dispatch)  │    │ (server or  │      │
//! │   └─────────────┘    └─────────────┘    │   client)   │      │
//! │          ▲                  │           └─────────────┘      │
//! │          │                  ▼                  │             │
//! │   ┌─────────────┐    ┌─────────────┐           ▼             │
//! │   │   writer    │◀───│ Correlator  │    ┌─────────────┐      │
//! │   │  (ordered)  │    │  (pending)  │    │  Registry   │      │
//! │   └─────────────┘    └─────────────┘    └─────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation speaks protocol version 1.0; peers must share the
//! major version.

pub mod capability;
pub mod client;
pub mod correlation;
pub mod error;
pub mod framing;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use client::{ClientOptions, McpClient};
pub use error::{McpError, TransportError};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Message, PROTOCOL_VERSION};
pub use registry::Registry;
pub use server::{McpServer, ServerOptions};

//! mcp-runtime: a Model Context Protocol runtime
//!
//! JSON-RPC 2.0 sessions between a client and a server that exposes tools,
//! resources, and prompts.
//!
//! # Architecture
//!
//! The runtime is layered:
//!
//! - **Framing**: newline-delimited JSON on byte streams, or HTTP POST plus
//!   resumable Server-Sent Events
//! - **Codec**: classifies JSON-RPC envelopes and builds protocol errors
//! - **Correlation**: matches replies to requests, with deadlines and
//!   cancellation
//! - **Session**: the `initialize`/`initialized` handshake and capability
//!   negotiation
//! - **Registry**: schema-validated tools, resources, and prompts
//!
//! # Modules
//!
//! - [`campaigns`] — Sample provider used by the binary
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`mcp`] — MCP protocol implementation

pub mod campaigns;
pub mod config;
pub mod error;
pub mod mcp;

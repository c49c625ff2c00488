//! MCP server.
//!
//! This module implements the server side of the session lifecycle:
//!
//! 1. **Initialisation**: version check and capability negotiation
//! 2. **Operation**: tools, resources, and prompts served from a [`Registry`]
//! 3. **Shutdown**: graceful termination on signal or end of stream
//!
//! One [`McpServer`] can serve any number of sessions; each call to
//! [`McpServer::serve`] runs one session on its own channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::capability::{
    CapabilitySet, Operation, PromptsCapability, ResourcesCapability, ToolsCapability,
};
use super::framing::DEFAULT_MAX_LINE_BYTES;
use super::peer::{PeerHandle, PeerOptions, RequestContext, Role, Service};
use super::protocol::{
    methods, ErrorCode, JsonRpcErrorData, JsonRpcNotification, JsonRpcRequest, PROTOCOL_VERSION,
    SERVER_NAME,
};
use super::registry::{HandlerContext, ProgressReporter, Registry, RegistryChange};
use super::session::{versions_compatible, Credential, Negotiated, Session};
use super::transport::{stdio, Channel};
use super::types::{
    GetPromptParams, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult, ToolCallParams,
};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Name and version reported in `serverInfo`.
    pub info: Implementation,
    /// Protocol version spoken; clients must share its major version.
    pub protocol_version: String,
    /// Free-form usage hints returned from `initialize`.
    pub instructions: Option<String>,
    /// Advertise `listChanged` and send change notifications.
    pub list_changed: bool,
    /// Deadline for requests the server sends to clients.
    pub request_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            info: Implementation::this_crate(SERVER_NAME),
            protocol_version: PROTOCOL_VERSION.to_string(),
            instructions: None,
            list_changed: true,
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// The MCP server: a registry plus the settings every session shares.
#[derive(Debug, Clone)]
pub struct McpServer {
    registry: Arc<Registry>,
    options: Arc<ServerOptions>,
}

impl McpServer {
    #[must_use]
    pub fn new(registry: Arc<Registry>, options: ServerOptions) -> Self {
        Self {
            registry,
            options: Arc::new(options),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Capabilities advertised in the `initialize` result.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        let list_changed = self.options.list_changed;
        CapabilitySet::new()
            .with(
                "tools",
                ToolsCapability {
                    list: true,
                    call: true,
                    list_changed,
                },
            )
            .with(
                "resources",
                ResourcesCapability {
                    list: true,
                    read: true,
                    list_changed,
                },
            )
            .with(
                "prompts",
                PromptsCapability {
                    list: true,
                    get: true,
                    list_changed,
                },
            )
    }

    /// Runs one session on `channel`.
    ///
    /// The credential is handed to every handler invoked on this session.
    #[must_use]
    pub fn serve(&self, channel: Channel, credential: Option<Credential>) -> PeerHandle {
        let session = Arc::new(Session::new(credential));
        let service = Arc::new(ServerService {
            registry: Arc::clone(&self.registry),
            options: Arc::clone(&self.options),
            capabilities: self.capabilities(),
        });
        let options = PeerOptions::new(Role::Server).with_request_timeout(self.options.request_timeout);

        info!(session = %session.id(), "Session started");
        PeerHandle::spawn(channel, service, session, options)
    }

    /// Serves one session over stdin/stdout until the client disconnects or
    /// a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run_stdio(
        &self,
        credential: Option<Credential>,
        max_line_bytes: usize,
    ) -> std::io::Result<()> {
        let max_line_bytes = if max_line_bytes == 0 {
            DEFAULT_MAX_LINE_BYTES
        } else {
            max_line_bytes
        };
        let peer = self.serve(stdio::stdio(max_line_bytes), credential);

        tokio::select! {
            () = peer.closed() => {
                info!("Client disconnected");
            }
            signal = shutdown_signal() => {
                signal?;
                info!("Initiating graceful shutdown");
                peer.close().await;
            }
        }

        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

/// Resolves on Ctrl+C.
///
/// # Errors
///
/// Returns an error if the signal handler cannot be installed.
#[cfg(windows)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, JsonRpcErrorData> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcErrorData::internal(format!("Failed to encode result: {e}")))
}

fn handler_context(ctx: &RequestContext) -> HandlerContext {
    let session = ctx.session();
    HandlerContext::new(session.id(), session.credential().cloned())
}

struct ServerService {
    registry: Arc<Registry>,
    options: Arc<ServerOptions>,
    capabilities: CapabilitySet,
}

impl ServerService {
    fn initialize(
        &self,
        ctx: &RequestContext,
        request: &JsonRpcRequest,
    ) -> Result<Value, JsonRpcErrorData> {
        let session = ctx.session();
        if let Err(state) = session.begin_initialize() {
            return Err(JsonRpcErrorData::invalid_request(format!(
                "Session already initialised (state: {state})"
            )));
        }

        let params: InitializeParams = match request.params_as() {
            Ok(params) => params,
            Err(e) => {
                session.abort_initialize();
                return Err(e);
            }
        };

        let supported = &self.options.protocol_version;
        if !versions_compatible(&params.protocol_version, supported) {
            session.abort_initialize();
            warn!(
                session = %session.id(),
                requested = %params.protocol_version,
                supported = %supported,
                "Rejecting incompatible protocol version"
            );
            return Err(JsonRpcErrorData::with_message(
                ErrorCode::UnsupportedProtocolVersion,
                format!(
                    "Unsupported protocol version {}; this server speaks {supported}",
                    params.protocol_version
                ),
            )
            .with_data(json!({
                "requested": params.protocol_version,
                "supported": [supported],
            })));
        }

        info!(
            session = %session.id(),
            client = params.client_info.as_ref().map_or("unknown", |c| c.name.as_str()),
            version = %params.protocol_version,
            "Client initialising"
        );

        session.complete_negotiation(Negotiated {
            protocol_version: supported.clone(),
            local: self.capabilities.clone(),
            remote: params.client_capabilities,
            peer_info: params.client_info,
        });

        to_result(&InitializeResult {
            protocol_version: supported.clone(),
            server_capabilities: self.capabilities.clone(),
            server_info: Some(self.options.info.clone()),
            instructions: self.options.instructions.clone(),
        })
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        request: &JsonRpcRequest,
    ) -> Result<Value, JsonRpcErrorData> {
        let params: ToolCallParams = request.params_as()?;
        let mut handler_ctx = handler_context(ctx);

        if let Some(token) = params.meta.and_then(|m| m.progress_token) {
            if ctx.session().peer_supports(Operation::Progress) {
                handler_ctx = handler_ctx.with_progress(ProgressReporter::new(token, ctx.peer().clone()));
            } else {
                debug!(token = %token, "Ignoring progress token, client did not advertise progress");
            }
        }

        let result = self
            .registry
            .call_tool(handler_ctx, &params.name, params.arguments)
            .await?;
        to_result(&result)
    }
}

#[async_trait]
impl Service for ServerService {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcErrorData> {
        match request.method.as_str() {
            methods::INITIALIZE => self.initialize(&ctx, &request),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => to_result(&ListToolsResult {
                tools: self.registry.list_tools(),
            }),
            methods::TOOLS_CALL => self.call_tool(&ctx, &request).await,
            methods::RESOURCES_LIST => to_result(&ListResourcesResult {
                resources: self.registry.list_resources(),
            }),
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = request.params_as()?;
                let contents = self
                    .registry
                    .read_resource(handler_context(&ctx), &params.uri)
                    .await?;
                to_result(&ReadResourceResult { contents })
            }
            methods::PROMPTS_LIST => to_result(&ListPromptsResult {
                prompts: self.registry.list_prompts(),
            }),
            methods::PROMPTS_GET => {
                let params: GetPromptParams = request.params_as()?;
                let result = self
                    .registry
                    .get_prompt(handler_context(&ctx), &params.name, params.arguments)
                    .await?;
                to_result(&result)
            }
            other => Err(JsonRpcErrorData::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, peer: &PeerHandle, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            methods::INITIALIZED | methods::INITIALIZED_ALIAS => {
                let session = peer.session();
                if session.mark_ready() {
                    info!(session = %session.id(), "Session ready");
                    let changes = self.registry.subscribe();
                    tokio::spawn(forward_list_changes(peer.clone(), changes));
                } else {
                    warn!(
                        session = %session.id(),
                        state = %session.state(),
                        "Ignoring initialized notification"
                    );
                }
            }
            _ => {}
        }
    }
}

/// Sends list-changed notifications for the namespaces this session
/// negotiated, until the session closes.
async fn forward_list_changes(peer: PeerHandle, mut changes: broadcast::Receiver<RegistryChange>) {
    let session = Arc::clone(peer.session());

    loop {
        let change = tokio::select! {
            change = changes.recv() => change,
            () = session.closed() => break,
        };

        let change = match change {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Registry change notifications lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let (operation, method) = match change {
            RegistryChange::Tools => (Operation::ToolsListChanged, methods::TOOLS_LIST_CHANGED),
            RegistryChange::Resources => {
                (Operation::ResourcesListChanged, methods::RESOURCES_LIST_CHANGED)
            }
            RegistryChange::Prompts => (Operation::PromptsListChanged, methods::PROMPTS_LIST_CHANGED),
        };

        if !session.local_supports(operation) || !session.is_ready() {
            continue;
        }
        debug!(session = %session.id(), method, "Sending list change");
        if peer.notify(method, None).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcResponse, Message, RequestId};
    use crate::mcp::registry::tool_fn;
    use crate::mcp::transport::{memory_pair, MessageSink};
    use crate::mcp::types::{ToolCallResult, ToolDefinition};
    use futures::StreamExt;

    fn server() -> McpServer {
        let registry = Arc::new(Registry::new());
        registry
            .register_tool(
                ToolDefinition::new("noop", "Does nothing", json!({"type": "object"})),
                tool_fn(|_ctx, _args| async { Ok(ToolCallResult::text("done")) }),
            )
            .unwrap();
        McpServer::new(registry, ServerOptions::default())
    }

    async fn roundtrip(raw: &mut Channel, id: i64, method: &str, params: Option<Value>) -> Message {
        raw.outgoing
            .send(JsonRpcRequest::new(id, method, params).into())
            .await
            .unwrap();
        loop {
            let message = raw.incoming.next().await.unwrap().unwrap();
            if message.id() == Some(&RequestId::Number(id)) {
                return message;
            }
        }
    }

    fn init_params(version: &str) -> Value {
        json!({"protocolVersion": version, "clientCapabilities": {"tools": {}}})
    }

    #[test]
    fn advertises_all_namespaces() {
        let caps = server().capabilities();
        assert!(caps.supports(Operation::ListTools));
        assert!(caps.supports(Operation::CallTool));
        assert!(caps.supports(Operation::ReadResource));
        assert!(caps.supports(Operation::GetPrompt));
        assert!(caps.supports(Operation::ToolsListChanged));

        let quiet = McpServer::new(
            Arc::new(Registry::new()),
            ServerOptions {
                list_changed: false,
                ..ServerOptions::default()
            },
        );
        assert!(!quiet.capabilities().supports(Operation::ToolsListChanged));
    }

    #[tokio::test]
    async fn handshake_then_list() {
        let (server_side, mut raw) = memory_pair(DEFAULT_MAX_LINE_BYTES);
        let peer = server().serve(server_side, None);

        let reply = roundtrip(&mut raw, 1, methods::INITIALIZE, Some(init_params("1.0"))).await;
        let Message::Response(JsonRpcResponse { result, .. }) = reply else {
            panic!("expected a result, got {reply:?}");
        };
        assert_eq!(result["protocolVersion"], "1.0");
        assert_eq!(result["serverCapabilities"]["tools"]["list"], true);
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);

        raw.outgoing
            .send(JsonRpcNotification::new(methods::INITIALIZED, None).into())
            .await
            .unwrap();
        let reply = roundtrip(&mut raw, 2, methods::TOOLS_LIST, None).await;
        let Message::Response(JsonRpcResponse { result, .. }) = reply else {
            panic!("expected a result, got {reply:?}");
        };
        assert_eq!(result["tools"][0]["name"], "noop");
        assert!(peer.session().is_ready());
    }

    #[tokio::test]
    async fn incompatible_version_is_rejected_and_retry_allowed() {
        let (server_side, mut raw) = memory_pair(DEFAULT_MAX_LINE_BYTES);
        let peer = server().serve(server_side, None);

        let reply = roundtrip(&mut raw, 1, methods::INITIALIZE, Some(init_params("2.0"))).await;
        let Message::Error(err) = reply else {
            panic!("expected an error, got {reply:?}");
        };
        assert_eq!(err.error.code, ErrorCode::UnsupportedProtocolVersion.code());
        assert_eq!(err.error.data.as_ref().unwrap()["requested"], "2.0");

        let reply = roundtrip(&mut raw, 2, methods::INITIALIZE, Some(init_params("1.3"))).await;
        assert!(matches!(reply, Message::Response(_)));
        assert!(!peer.session().is_ready());
    }

    #[tokio::test]
    async fn second_initialize_is_invalid_request() {
        let (server_side, mut raw) = memory_pair(DEFAULT_MAX_LINE_BYTES);
        let _peer = server().serve(server_side, None);

        roundtrip(&mut raw, 1, methods::INITIALIZE, Some(init_params("1.0"))).await;
        let reply = roundtrip(&mut raw, 2, methods::INITIALIZE, Some(init_params("1.0"))).await;
        let Message::Error(err) = reply else {
            panic!("expected an error, got {reply:?}");
        };
        assert_eq!(err.error.code, ErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn list_changed_reaches_ready_sessions() {
        let server = server();
        let (server_side, mut raw) = memory_pair(DEFAULT_MAX_LINE_BYTES);
        let _peer = server.serve(server_side, None);

        roundtrip(&mut raw, 1, methods::INITIALIZE, Some(init_params("1.0"))).await;
        raw.outgoing
            .send(JsonRpcNotification::new(methods::INITIALIZED_ALIAS, None).into())
            .await
            .unwrap();
        // Ping confirms the notification was processed and the forwarder is running.
        roundtrip(&mut raw, 2, methods::PING, None).await;

        server.registry().unregister_tool("noop");
        let message = raw.incoming.next().await.unwrap().unwrap();
        assert_eq!(message.method(), Some(methods::TOOLS_LIST_CHANGED));
    }
}

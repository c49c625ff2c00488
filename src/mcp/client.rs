//! MCP client.
//!
//! [`McpClient`] drives the handshake from the client side and then offers
//! typed calls for every operation the server advertised. Operations the
//! server did not advertise are refused locally with
//! [`McpError::NotAdvertised`] and never reach the wire.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::capability::{CapabilitySet, Operation};
use super::error::{McpError, TransportError};
use super::framing::DEFAULT_MAX_LINE_BYTES;
use super::peer::{
    CallOptions, NotificationListener, PeerHandle, PeerOptions, PendingRequest, RequestContext,
    Role, Service,
};
use super::protocol::{methods, JsonRpcErrorData, JsonRpcRequest, RequestId, PROTOCOL_VERSION};
use super::session::{versions_compatible, Negotiated, Session};
use super::transport::http_client::HttpClientTransport;
use super::transport::{stdio, Channel};
use super::types::{
    GetPromptResult, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PromptDefinition, ReadResourceResult, RequestMeta,
    ResourceContents, ResourceDefinition, ToolCallParams, ToolCallResult, ToolDefinition,
};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name and version reported in `clientInfo`.
    pub info: Implementation,
    /// Protocol version requested.
    pub protocol_version: String,
    /// Capabilities advertised to the server.
    pub capabilities: CapabilitySet,
    /// Default deadline for requests; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            info: Implementation::this_crate("mcp-runtime-client"),
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: CapabilitySet::new()
                .with("tools", json!({}))
                .with("progress", json!({})),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Decodes a result value into `T`.
///
/// # Errors
///
/// Returns [`McpError::InvalidResponse`] if the value has the wrong shape.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::InvalidResponse(e.to_string()))
}

struct ClientService;

#[async_trait]
impl Service for ClientService {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcErrorData> {
        match request.method.as_str() {
            methods::PING => Ok(json!({})),
            other => Err(JsonRpcErrorData::method_not_found(other)),
        }
    }
}

/// Client end of one session.
#[derive(Debug)]
pub struct McpClient {
    peer: PeerHandle,
    options: ClientOptions,
    child: Option<Child>,
}

impl McpClient {
    /// Starts a client on `channel`. Call [`Self::initialize`] next.
    #[must_use]
    pub fn connect(channel: Channel, options: ClientOptions) -> Self {
        let peer = PeerHandle::spawn(
            channel,
            Arc::new(ClientService),
            Arc::new(Session::new(None)),
            PeerOptions::new(Role::Client).with_request_timeout(options.request_timeout),
        );
        Self {
            peer,
            options,
            child: None,
        }
    }

    /// Spawns a stdio server and connects to it. The child is killed when
    /// the client is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub fn spawn_stdio(
        command: &str,
        args: &[String],
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let (channel, child) = stdio::spawn_child(command, args, DEFAULT_MAX_LINE_BYTES)?;
        let mut client = Self::connect(channel, options);
        client.child = Some(child);
        Ok(client)
    }

    /// Connects over HTTP.
    #[must_use]
    pub fn connect_http(transport: HttpClientTransport, options: ClientOptions) -> Self {
        info!(url = %transport.url(), "Connecting over HTTP");
        Self::connect(transport.connect(), options)
    }

    #[must_use]
    pub const fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }

    /// Performs the handshake: `initialize`, version check, then the
    /// `initialized` notification. The session is `Ready` on success.
    ///
    /// # Errors
    ///
    /// - [`McpError::NotReady`] if the session is past `Created`
    /// - [`McpError::UnsupportedVersion`] if the server's major version differs
    /// - any request error from `initialize`
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let session = self.session();
        session
            .begin_initialize()
            .map_err(|state| McpError::NotReady {
                method: methods::INITIALIZE.to_string(),
                state,
            })?;

        match self.handshake().await {
            Ok(result) => {
                session.mark_ready();
                info!(
                    session = %session.id(),
                    server = result.server_info.as_ref().map_or("unknown", |s| s.name.as_str()),
                    version = %result.protocol_version,
                    "Session ready"
                );
                Ok(result)
            }
            Err(e) => {
                session.abort_initialize();
                warn!(error = %e, "Handshake failed");
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            client_capabilities: self.options.capabilities.clone(),
            client_info: Some(self.options.info.clone()),
        };
        let params = serde_json::to_value(&params).map_err(TransportError::from)?;

        let result: InitializeResult =
            decode(self.peer.request(methods::INITIALIZE, Some(params)).await?)?;

        if !versions_compatible(&result.protocol_version, &self.options.protocol_version) {
            return Err(McpError::UnsupportedVersion {
                offered: result.protocol_version,
                supported: self.options.protocol_version.clone(),
            });
        }

        self.session().complete_negotiation(Negotiated {
            protocol_version: result.protocol_version.clone(),
            local: self.options.capabilities.clone(),
            remote: result.server_capabilities.clone(),
            peer_info: result.server_info.clone(),
        });
        self.peer.notify(methods::INITIALIZED, None)?;
        Ok(result)
    }

    fn require(&self, operation: Operation) -> Result<(), McpError> {
        let session = self.session();
        if !session.is_ready() {
            return Err(McpError::NotReady {
                method: operation.name().to_string(),
                state: session.state(),
            });
        }
        if !session.peer_supports(operation) {
            debug!(operation = %operation, "Refusing operation the server did not advertise");
            return Err(McpError::NotAdvertised {
                operation: operation.name(),
            });
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: Operation,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        self.require(operation)?;
        decode(self.peer.request(method, params).await?)
    }

    /// # Errors
    ///
    /// Fails if the server did not advertise `tools.list` or the call fails.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let result: ListToolsResult = self.call(Operation::ListTools, methods::TOOLS_LIST, None).await?;
        Ok(result.tools)
    }

    /// Calls a tool and waits for its result.
    ///
    /// # Errors
    ///
    /// Fails if the server did not advertise `tools.call` or the call fails.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let pending = self.start_tool_call(name, arguments, None, CallOptions::default())?;
        decode(pending.wait().await?)
    }

    /// Starts a tool call without waiting, for cancellation or custom
    /// deadlines. With a `progress_token`, the server may send
    /// `notifications/progress` for this call; listen with
    /// [`Self::on_notification`]. Decode the reply with [`decode`].
    ///
    /// # Errors
    ///
    /// Fails if the server did not advertise `tools.call` or the request
    /// cannot be issued.
    pub fn start_tool_call(
        &self,
        name: &str,
        arguments: Value,
        progress_token: Option<RequestId>,
        options: CallOptions,
    ) -> Result<PendingRequest, McpError> {
        self.require(Operation::CallTool)?;
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
            meta: progress_token.map(|token| RequestMeta {
                progress_token: Some(token),
            }),
        };
        let params = serde_json::to_value(&params).map_err(TransportError::from)?;
        self.peer.start_request(methods::TOOLS_CALL, Some(params), options)
    }

    /// # Errors
    ///
    /// Fails if the server did not advertise `resources.list` or the call fails.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>, McpError> {
        let result: ListResourcesResult = self
            .call(Operation::ListResources, methods::RESOURCES_LIST, None)
            .await?;
        Ok(result.resources)
    }

    /// # Errors
    ///
    /// Fails if the server did not advertise `resources.read` or the call fails.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let result: ReadResourceResult = self
            .call(
                Operation::ReadResource,
                methods::RESOURCES_READ,
                Some(json!({ "uri": uri })),
            )
            .await?;
        Ok(result.contents)
    }

    /// # Errors
    ///
    /// Fails if the server did not advertise `prompts.list` or the call fails.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDefinition>, McpError> {
        let result: ListPromptsResult = self
            .call(Operation::ListPrompts, methods::PROMPTS_LIST, None)
            .await?;
        Ok(result.prompts)
    }

    /// # Errors
    ///
    /// Fails if the server did not advertise `prompts.get` or the call fails.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        self.call(
            Operation::GetPrompt,
            methods::PROMPTS_GET,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Checks that the server is responsive.
    ///
    /// # Errors
    ///
    /// Fails if the session is not ready or the server does not answer.
    pub async fn ping(&self) -> Result<(), McpError> {
        self.peer.request(methods::PING, None).await.map(|_| ())
    }

    /// Sends an arbitrary request. Methods that map to a capability-gated
    /// operation are refused locally unless the server advertised it.
    ///
    /// # Errors
    ///
    /// - [`McpError::NotAdvertised`] for a gated method the server lacks
    /// - otherwise see [`PeerHandle::request`]
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if let Some(operation) = Operation::for_method(method) {
            self.require(operation)?;
        }
        self.peer.request(method, params).await
    }

    /// Cancels an outstanding request. Returns `false` if it already settled.
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) -> bool {
        self.peer.cancel(id, reason)
    }

    /// Registers a listener for server notifications.
    pub fn on_notification(&self, method: &str, listener: Arc<dyn NotificationListener>) {
        self.peer.on_notification(method, listener);
    }

    /// Closes the session; outstanding requests fail with [`McpError::Closed`].
    pub async fn close(mut self) {
        self.peer.close().await;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait().await {
                debug!(error = %e, "Could not reap server process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::registry::{tool_fn, Registry};
    use crate::mcp::server::{McpServer, ServerOptions};
    use crate::mcp::protocol::{JsonRpcResponse, Message};
    use crate::mcp::transport::{memory_pair, MessageSink};
    use futures::StreamExt;

    fn pair(server: ServerOptions, client: ClientOptions) -> (McpClient, McpServer) {
        let registry = Arc::new(Registry::new());
        registry
            .register_tool(
                ToolDefinition::new(
                    "echo",
                    "Echoes its input",
                    json!({
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }),
                ),
                tool_fn(|_ctx, args| async move {
                    Ok(ToolCallResult::text(args["text"].as_str().unwrap_or_default()))
                }),
            )
            .unwrap();

        let server = McpServer::new(registry, server);
        let (a, b) = memory_pair(DEFAULT_MAX_LINE_BYTES);
        let _peer = server.serve(b, None);
        (McpClient::connect(a, client), server)
    }

    #[tokio::test]
    async fn initialize_then_call() {
        let (client, _server) = pair(ServerOptions::default(), ClientOptions::default());

        let result = client.initialize().await.unwrap();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert!(client.session().is_ready());

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "echo");

        let result = client.call_tool("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(result.joined_text(), "hi");

        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn calls_before_initialize_are_refused_locally() {
        let (client, _server) = pair(ServerOptions::default(), ClientOptions::default());
        assert!(matches!(
            client.list_tools().await,
            Err(McpError::NotReady { .. })
        ));
        assert!(matches!(client.ping().await, Err(McpError::NotReady { .. })));
    }

    #[tokio::test]
    async fn major_version_mismatch_fails_handshake() {
        let client_options = ClientOptions {
            protocol_version: "2.0".to_string(),
            ..ClientOptions::default()
        };
        let (client, _server) = pair(ServerOptions::default(), client_options);

        let err = client.initialize().await.unwrap_err();
        assert_eq!(err.remote_code(), Some(-32000));
        assert!(!client.session().is_ready());
    }

    #[tokio::test]
    async fn unadvertised_operation_never_hits_the_wire() {
        let (a, mut raw) = memory_pair(DEFAULT_MAX_LINE_BYTES);
        let client = McpClient::connect(a, ClientOptions::default());

        let responder = tokio::spawn(async move {
            let Some(Ok(Message::Request(init))) = raw.incoming.next().await else {
                panic!("expected initialize");
            };
            let result = json!({
                "protocolVersion": "1.0",
                "serverCapabilities": {"tools": {"list": true, "call": true}}
            });
            raw.outgoing
                .send(JsonRpcResponse::success(init.id, result).into())
                .await
                .unwrap();
            let initialized = raw.incoming.next().await.unwrap().unwrap();
            assert_eq!(initialized.method(), Some(methods::INITIALIZED));
            raw
        });

        client.initialize().await.unwrap();
        let mut raw = responder.await.unwrap();

        assert!(matches!(
            client.list_resources().await,
            Err(McpError::NotAdvertised { .. })
        ));
        assert!(matches!(
            client.get_prompt("draft", BTreeMap::new()).await,
            Err(McpError::NotAdvertised { .. })
        ));
        assert!(matches!(
            client
                .request(methods::RESOURCES_READ, Some(json!({"uri": "campaigns://all"})))
                .await,
            Err(McpError::NotAdvertised {
                operation: "resources/read"
            })
        ));

        client.close().await;
        assert!(raw.incoming.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_arguments_surface_as_invalid_params() {
        let (client, _server) = pair(ServerOptions::default(), ClientOptions::default());
        client.initialize().await.unwrap();

        let err = client.call_tool("echo", json!({})).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(-32602));
    }
}

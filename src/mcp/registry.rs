//! Registry of tools, resources, and prompts.
//!
//! Entries are kept in registration order so that listing is stable.
//! Every invocation goes through the same boundary:
//!
//! - unknown names are rejected with invalid params (or resource not found)
//! - tool arguments are validated against the tool's input schema before the
//!   handler runs
//! - handler errors and panics become internal errors; they never take the
//!   session down
//! - each invocation is recorded on the `audit` tracing target

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::peer::PeerHandle;
use super::protocol::{ErrorCode, JsonRpcErrorData, JsonRpcNotification, RequestId};
use super::schema;
use super::session::Credential;
use super::types::{
    GetPromptResult, PromptDefinition, ResourceContents, ResourceDefinition, ToolCallResult,
    ToolDefinition,
};

/// Error returned by a handler.
///
/// Defaults to an internal error (-32603). Handlers that detect bad input
/// beyond what the schema expresses can use [`HandlerError::invalid_params`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    code: ErrorCode,
    message: String,
    data: Option<Value>,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidParams,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Converts into the JSON-RPC error sent to the caller.
    #[must_use]
    pub fn into_error_data(self) -> JsonRpcErrorData {
        let error = JsonRpcErrorData::with_message(self.code, self.message);
        match self.data {
            Some(data) => error.with_data(data),
            None => error,
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("JSON error: {err}"))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("I/O error: {err}"))
    }
}

/// Errors raised while changing the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An entry with the same key already exists.
    #[error("{kind} {name:?} is already registered")]
    Duplicate {
        kind: &'static str,
        name: String,
    },

    /// A tool's input schema is unusable.
    #[error("tool {name:?} has an invalid input schema: {reason}")]
    InvalidSchema {
        name: String,
        reason: String,
    },
}

/// Which list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Tools,
    Resources,
    Prompts,
}

/// Sends `notifications/progress` for one request.
#[derive(Clone)]
pub struct ProgressReporter {
    token: RequestId,
    peer: PeerHandle,
}

impl ProgressReporter {
    #[must_use]
    pub const fn new(token: RequestId, peer: PeerHandle) -> Self {
        Self { token, peer }
    }

    /// Reports progress. Failures are logged and otherwise ignored.
    pub fn report(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        let notification = JsonRpcNotification::progress(&self.token, progress, total, message);
        if let Err(e) = self.peer.send(notification.into()) {
            debug!(token = %self.token, error = %e, "Dropped progress notification");
        }
    }
}

/// What a handler knows about the call it is serving.
#[derive(Clone, Default)]
pub struct HandlerContext {
    session_id: String,
    credential: Option<Credential>,
    progress: Option<ProgressReporter>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(session_id: impl Into<String>, credential: Option<Credential>) -> Self {
        Self {
            session_id: session_id.into(),
            credential,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The connection's credential, passed through untouched.
    #[must_use]
    pub const fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Reports progress if the caller asked for it; otherwise does nothing.
    pub fn report_progress(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        if let Some(reporter) = &self.progress {
            reporter.report(progress, total, message);
        }
    }
}

/// Handler for a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Runs the tool with schema-validated arguments.
    async fn call(&self, ctx: HandlerContext, arguments: Value) -> Result<ToolCallResult, HandlerError>;
}

/// Handler for a resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, ctx: HandlerContext, uri: &str) -> Result<Vec<ResourceContents>, HandlerError>;
}

/// Handler for a prompt.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Renders the prompt. Required arguments are guaranteed present.
    async fn render(
        &self,
        ctx: HandlerContext,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, HandlerError>;
}

struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolCallResult, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: HandlerContext, arguments: Value) -> Result<ToolCallResult, HandlerError> {
        (self.0)(ctx, arguments).await
    }
}

struct FnResource<F>(F);

#[async_trait]
impl<F, Fut> ResourceHandler for FnResource<F>
where
    F: Fn(HandlerContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<ResourceContents>, HandlerError>> + Send + 'static,
{
    async fn read(&self, ctx: HandlerContext, uri: &str) -> Result<Vec<ResourceContents>, HandlerError> {
        (self.0)(ctx, uri.to_string()).await
    }
}

struct FnPrompt<F>(F);

#[async_trait]
impl<F, Fut> PromptHandler for FnPrompt<F>
where
    F: Fn(HandlerContext, BTreeMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetPromptResult, HandlerError>> + Send + 'static,
{
    async fn render(
        &self,
        ctx: HandlerContext,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, HandlerError> {
        (self.0)(ctx, arguments).await
    }
}

/// Wraps an async closure as a [`ToolHandler`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolCallResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnTool(f))
}

/// Wraps an async closure as a [`ResourceHandler`].
pub fn resource_fn<F, Fut>(f: F) -> Arc<dyn ResourceHandler>
where
    F: Fn(HandlerContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<ResourceContents>, HandlerError>> + Send + 'static,
{
    Arc::new(FnResource(f))
}

/// Wraps an async closure as a [`PromptHandler`].
pub fn prompt_fn<F, Fut>(f: F) -> Arc<dyn PromptHandler>
where
    F: Fn(HandlerContext, BTreeMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetPromptResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnPrompt(f))
}

struct ToolEntry {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

struct ResourceEntry {
    definition: ResourceDefinition,
    handler: Arc<dyn ResourceHandler>,
}

struct PromptEntry {
    definition: PromptDefinition,
    handler: Arc<dyn PromptHandler>,
}

/// Named, schema-described tools, resources, and prompts.
pub struct Registry {
    tools: RwLock<IndexMap<String, Arc<ToolEntry>>>,
    resources: RwLock<IndexMap<String, Arc<ResourceEntry>>>,
    prompts: RwLock<IndexMap<String, Arc<PromptEntry>>>,
    changes: broadcast::Sender<RegistryChange>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.tool_names())
            .field("resources", &self.list_resources().len())
            .field("prompts", &self.list_prompts().len())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            tools: RwLock::new(IndexMap::new()),
            resources: RwLock::new(IndexMap::new()),
            prompts: RwLock::new(IndexMap::new()),
            changes,
        }
    }

    /// Subscribes to list changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    fn changed(&self, change: RegistryChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or the input schema is not an object schema.
    pub fn register_tool(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        schema::check_tool_schema(&definition.input_schema).map_err(|reason| {
            RegistryError::InvalidSchema {
                name: definition.name.clone(),
                reason,
            }
        })?;

        let mut tools = write(&self.tools);
        if tools.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate {
                kind: "tool",
                name: definition.name,
            });
        }
        debug!(tool = %definition.name, "Registered tool");
        tools.insert(
            definition.name.clone(),
            Arc::new(ToolEntry {
                definition,
                handler,
            }),
        );
        drop(tools);

        self.changed(RegistryChange::Tools);
        Ok(())
    }

    /// Removes a tool. Returns `false` if it was not registered.
    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = write(&self.tools).shift_remove(name).is_some();
        if removed {
            self.changed(RegistryChange::Tools);
        }
        removed
    }

    /// Tool definitions in registration order.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        read(&self.tools)
            .values()
            .map(|e| e.definition.clone())
            .collect()
    }

    fn tool_names(&self) -> Vec<String> {
        read(&self.tools).keys().cloned().collect()
    }

    /// Returns a tool's definition, including its input schema.
    #[must_use]
    pub fn describe_tool(&self, name: &str) -> Option<ToolDefinition> {
        read(&self.tools).get(name).map(|e| e.definition.clone())
    }

    /// Validates arguments and runs a tool.
    ///
    /// # Errors
    ///
    /// - invalid params (-32602) for an unknown tool or schema violations
    ///   (the violations are listed in `data`)
    /// - internal error (-32603) when the handler fails or panics
    pub async fn call_tool(
        &self,
        ctx: HandlerContext,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, JsonRpcErrorData> {
        let entry = read(&self.tools)
            .get(name)
            .cloned()
            .ok_or_else(|| JsonRpcErrorData::invalid_params(format!("Unknown tool: {name}")))?;

        let arguments = if arguments.is_null() {
            Value::Object(Map::new())
        } else {
            arguments
        };

        if let Err(violations) = schema::validate(&entry.definition.input_schema, &arguments) {
            info!(
                target: "audit",
                session = %ctx.session_id(),
                tool = name,
                outcome = "rejected",
                violations = violations.len(),
                "Tool call rejected by schema"
            );
            return Err(
                JsonRpcErrorData::invalid_params(format!("Invalid arguments for tool {name}"))
                    .with_data(json!({ "violations": violations })),
            );
        }

        let session = ctx.session_id().to_string();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(entry.handler.call(ctx, arguments))
            .catch_unwind()
            .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Ok(result)) => {
                info!(
                    target: "audit",
                    session = %session,
                    tool = name,
                    outcome = if result.is_error { "tool_error" } else { "ok" },
                    elapsed_ms,
                    "Tool call completed"
                );
                Ok(result)
            }
            Ok(Err(err)) => {
                warn!(
                    target: "audit",
                    session = %session,
                    tool = name,
                    outcome = "failed",
                    elapsed_ms,
                    error = %err,
                    "Tool call failed"
                );
                Err(err.into_error_data())
            }
            Err(_) => {
                error!(
                    target: "audit",
                    session = %session,
                    tool = name,
                    outcome = "panicked",
                    elapsed_ms,
                    "Tool handler panicked"
                );
                Err(JsonRpcErrorData::internal(format!("Tool {name} panicked")))
            }
        }
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Registers a resource, keyed by URI.
    ///
    /// # Errors
    ///
    /// Fails if the URI is taken.
    pub fn register_resource(
        &self,
        definition: ResourceDefinition,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<(), RegistryError> {
        let mut resources = write(&self.resources);
        if resources.contains_key(&definition.uri) {
            return Err(RegistryError::Duplicate {
                kind: "resource",
                name: definition.uri,
            });
        }
        debug!(uri = %definition.uri, "Registered resource");
        resources.insert(
            definition.uri.clone(),
            Arc::new(ResourceEntry {
                definition,
                handler,
            }),
        );
        drop(resources);

        self.changed(RegistryChange::Resources);
        Ok(())
    }

    /// Removes a resource. Returns `false` if it was not registered.
    pub fn unregister_resource(&self, uri: &str) -> bool {
        let removed = write(&self.resources).shift_remove(uri).is_some();
        if removed {
            self.changed(RegistryChange::Resources);
        }
        removed
    }

    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceDefinition> {
        read(&self.resources)
            .values()
            .map(|e| e.definition.clone())
            .collect()
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Resource not found (-32002) for an unknown URI, internal error when
    /// the handler fails.
    pub async fn read_resource(
        &self,
        ctx: HandlerContext,
        uri: &str,
    ) -> Result<Vec<ResourceContents>, JsonRpcErrorData> {
        let entry = read(&self.resources).get(uri).cloned().ok_or_else(|| {
            JsonRpcErrorData::with_message(ErrorCode::ResourceNotFound, format!("Unknown resource: {uri}"))
                .with_data(json!({ "uri": uri }))
        })?;

        let session = ctx.session_id().to_string();
        let outcome = AssertUnwindSafe(entry.handler.read(ctx, uri))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(contents)) => {
                info!(target: "audit", session = %session, resource = uri, outcome = "ok", "Resource read");
                Ok(contents)
            }
            Ok(Err(err)) => {
                warn!(target: "audit", session = %session, resource = uri, outcome = "failed", error = %err, "Resource read failed");
                Err(err.into_error_data())
            }
            Err(_) => {
                error!(target: "audit", session = %session, resource = uri, outcome = "panicked", "Resource handler panicked");
                Err(JsonRpcErrorData::internal(format!("Resource {uri} panicked")))
            }
        }
    }

    // ========================================================================
    // Prompts
    // ========================================================================

    /// Registers a prompt.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken.
    pub fn register_prompt(
        &self,
        definition: PromptDefinition,
        handler: Arc<dyn PromptHandler>,
    ) -> Result<(), RegistryError> {
        let mut prompts = write(&self.prompts);
        if prompts.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate {
                kind: "prompt",
                name: definition.name,
            });
        }
        debug!(prompt = %definition.name, "Registered prompt");
        prompts.insert(
            definition.name.clone(),
            Arc::new(PromptEntry {
                definition,
                handler,
            }),
        );
        drop(prompts);

        self.changed(RegistryChange::Prompts);
        Ok(())
    }

    /// Removes a prompt. Returns `false` if it was not registered.
    pub fn unregister_prompt(&self, name: &str) -> bool {
        let removed = write(&self.prompts).shift_remove(name).is_some();
        if removed {
            self.changed(RegistryChange::Prompts);
        }
        removed
    }

    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptDefinition> {
        read(&self.prompts)
            .values()
            .map(|e| e.definition.clone())
            .collect()
    }

    #[must_use]
    pub fn describe_prompt(&self, name: &str) -> Option<PromptDefinition> {
        read(&self.prompts).get(name).map(|e| e.definition.clone())
    }

    /// Renders a prompt.
    ///
    /// # Errors
    ///
    /// Invalid params for an unknown prompt or missing required arguments,
    /// internal error when the handler fails.
    pub async fn get_prompt(
        &self,
        ctx: HandlerContext,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, JsonRpcErrorData> {
        let entry = read(&self.prompts)
            .get(name)
            .cloned()
            .ok_or_else(|| JsonRpcErrorData::invalid_params(format!("Unknown prompt: {name}")))?;

        let missing: Vec<&str> = entry
            .definition
            .arguments
            .iter()
            .filter(|a| a.required && !arguments.contains_key(&a.name))
            .map(|a| a.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(JsonRpcErrorData::invalid_params(format!(
                "Missing required arguments for prompt {name}: {}",
                missing.join(", ")
            ))
            .with_data(json!({ "missing": missing })));
        }

        let session = ctx.session_id().to_string();
        let outcome = AssertUnwindSafe(entry.handler.render(ctx, arguments))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                info!(target: "audit", session = %session, prompt = name, outcome = "ok", "Prompt rendered");
                Ok(result)
            }
            Ok(Err(err)) => {
                warn!(target: "audit", session = %session, prompt = name, outcome = "failed", error = %err, "Prompt failed");
                Err(err.into_error_data())
            }
            Err(_) => {
                error!(target: "audit", session = %session, prompt = name, outcome = "panicked", "Prompt handler panicked");
                Err(JsonRpcErrorData::internal(format!("Prompt {name} panicked")))
            }
        }
    }
}

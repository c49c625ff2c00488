//! One side of a JSON-RPC session.
//!
//! A peer owns three tasks:
//!
//! - a reader that classifies inbound frames, resolves replies through the
//!   [`Correlator`], and dispatches requests to a [`Service`]
//! - a writer that serialises every outbound message onto the transport in
//!   the order it was queued
//! - a listener task that feeds notifications to registered listeners
//!
//! Each inbound request runs in its own task, so a slow handler never
//! delays the reader or other requests, and replies go out in completion
//! order. Inbound requests are checked against the session lifecycle
//! before dispatch; only `initialize` is accepted before `Ready`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::correlation::{CallResult, CallState, Correlator, Delivery};
use super::error::McpError;
use super::framing::FrameError;
use super::protocol::{
    methods, JsonRpcError, JsonRpcErrorData, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, Message, RequestId,
};
use super::registry::HandlerError;
use super::session::Session;
use super::transport::{Channel, MessageSink, MessageStream};
use super::types::CancelledParams;

/// Which end of the session this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Behaviour knobs for a peer.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub role: Role,
    /// Default deadline for outbound requests; `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Send `notifications/cancelled` when an outbound request is cancelled,
    /// abandoned, or times out.
    pub notify_on_cancel: bool,
}

impl PeerOptions {
    #[must_use]
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            request_timeout: None,
            notify_on_cancel: true,
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Use this ID instead of a generated one.
    pub id: Option<RequestId>,
    /// Override the peer's default deadline.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Handles requests and notifications addressed to this peer.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Produces the result (or error) for one inbound request.
    async fn handle_request(
        &self,
        ctx: RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcErrorData>;

    /// Called inline by the reader for every inbound notification, before
    /// the next frame is read. Must not wait on the peer.
    async fn handle_notification(&self, peer: &PeerHandle, notification: &JsonRpcNotification) {
        let _ = (peer, notification);
    }
}

/// Receives notifications for one method.
#[async_trait]
pub trait NotificationListener: Send + Sync {
    async fn on_notification(&self, notification: JsonRpcNotification) -> Result<(), HandlerError>;
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> NotificationListener for FnListener<F>
where
    F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn on_notification(&self, notification: JsonRpcNotification) -> Result<(), HandlerError> {
        (self.0)(notification).await
    }
}

/// Wraps an async closure as a [`NotificationListener`].
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn NotificationListener>
where
    F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnListener(f))
}

/// What a request handler knows about the request it is serving.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    peer: PeerHandle,
}

impl RequestContext {
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// The peer the request arrived on, for sending notifications back.
    #[must_use]
    pub const fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }
}

struct PeerInner {
    options: PeerOptions,
    session: Arc<Session>,
    correlator: Correlator,
    outbound: mpsc::UnboundedSender<Message>,
    notifications: mpsc::UnboundedSender<JsonRpcNotification>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn NotificationListener>>>>,
    inflight: Mutex<HashMap<RequestId, AbortHandle>>,
    shutdown: CancellationToken,
}

/// Cloneable handle to a running peer.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("role", &self.inner.options.role)
            .field("session", &self.inner.session.id())
            .field("state", &self.inner.session.state())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    /// Starts the reader, writer, and listener tasks for `channel`.
    #[must_use]
    pub fn spawn(
        channel: Channel,
        service: Arc<dyn Service>,
        session: Arc<Session>,
        options: PeerOptions,
    ) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (notifications, notification_queue) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let peer = Self {
            inner: Arc::new(PeerInner {
                options,
                session,
                correlator: Correlator::new(),
                outbound,
                notifications,
                listeners: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                shutdown: shutdown.clone(),
            }),
        };

        let Channel { incoming, outgoing } = channel;
        let writer = tokio::spawn(write_loop(outgoing, queue, shutdown));
        tokio::spawn(listener_loop(peer.clone(), notification_queue));
        tokio::spawn(read_loop(peer.clone(), incoming, service, writer));

        debug!(
            session = %peer.session().id(),
            role = ?peer.inner.options.role,
            "Peer started"
        );
        peer
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Outbound request bookkeeping, for inspection.
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.options.role
    }

    /// Number of inbound requests currently being handled.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<RequestId, AbortHandle>> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners_for(&self, method: &str) -> Vec<Arc<dyn NotificationListener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    /// Queues a raw message for the writer.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Closed`] once the peer is shutting down.
    pub fn send(&self, message: Message) -> Result<(), McpError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(McpError::Closed);
        }
        self.inner.outbound.send(message).map_err(|_| McpError::Closed)
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Closed`] once the peer is shutting down.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.send(JsonRpcNotification::new(method, params).into())
    }

    /// Registers a listener for notifications with the given method.
    pub fn on_notification(&self, method: &str, listener: Arc<dyn NotificationListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.to_string())
            .or_default()
            .push(listener);
    }

    /// Issues a request and returns a handle to await its reply.
    ///
    /// # Errors
    ///
    /// - [`McpError::NotReady`] if the session lifecycle forbids the method
    /// - [`McpError::DuplicateId`] if a caller-chosen ID is outstanding
    /// - [`McpError::Closed`] if the peer is shutting down
    pub fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<PendingRequest, McpError> {
        self.inner
            .session
            .admit(method)
            .map_err(|state| McpError::NotReady {
                method: method.to_string(),
                state,
            })?;

        let (id, receiver) = self.inner.correlator.issue(method, options.id)?;
        debug!(id = %id, method, "Sending request");

        if let Err(e) = self.send(JsonRpcRequest::new(id.clone(), method, params).into()) {
            self.inner.correlator.settle(&id, CallState::Cancelled, McpError::Closed);
            return Err(e);
        }

        Ok(PendingRequest {
            id,
            method: method.to_string(),
            receiver,
            timeout: options.timeout.or(self.inner.options.request_timeout),
            peer: self.clone(),
            settled: false,
        })
    }

    /// Issues a request and waits for its reply.
    ///
    /// # Errors
    ///
    /// See [`Self::start_request`] and [`PendingRequest::wait`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.start_request(method, params, CallOptions::default())?
            .wait()
            .await
    }

    /// Issues a request with per-call options and waits for its reply.
    ///
    /// # Errors
    ///
    /// See [`Self::start_request`] and [`PendingRequest::wait`].
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<Value, McpError> {
        self.start_request(method, params, options)?.wait().await
    }

    /// Cancels an outstanding outbound request.
    ///
    /// The waiting caller gets [`McpError::Cancelled`] and the peer is told
    /// (best effort). A reply that still arrives is discarded. Returns
    /// `false` if the request had already settled.
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) -> bool {
        if !self.inner.correlator.cancel(id) {
            return false;
        }
        info!(id = %id, reason = reason.unwrap_or("none"), "Cancelled outbound request");
        self.send_cancellation(id, reason);
        true
    }

    fn send_cancellation(&self, id: &RequestId, reason: Option<&str>) {
        if !self.inner.options.notify_on_cancel {
            return;
        }
        if let Err(e) = self.send(JsonRpcNotification::cancelled(id, reason).into()) {
            debug!(id = %id, error = %e, "Could not send cancellation");
        }
    }

    /// Shuts the peer down and waits until the session is closed.
    ///
    /// Queued messages are flushed, outstanding requests fail with
    /// [`McpError::Closed`], and in-flight handlers are aborted.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.session.closed().await;
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        self.inner.session.closed().await;
    }

    fn reply(&self, id: RequestId, outcome: Result<Value, JsonRpcErrorData>) {
        let message = match outcome {
            Ok(result) => Message::Response(JsonRpcResponse::success(id, result)),
            Err(error) => Message::Error(JsonRpcError::new(Some(id), error)),
        };
        if let Err(e) = self.send(message) {
            debug!(error = %e, "Reply dropped, peer is closing");
        }
    }

    fn reject_frame(&self, frame_error: &FrameError) {
        warn!(
            session = %self.session().id(),
            error = %frame_error,
            "Discarding malformed frame"
        );
        if self.inner.options.role == Role::Server {
            if let Err(e) = self.send(frame_error.to_reply().into()) {
                debug!(error = %e, "Could not report malformed frame");
            }
        }
    }

    async fn dispatch(&self, message: Message, service: &Arc<dyn Service>) {
        match message {
            Message::Response(resp) => self.deliver(&resp.id, Ok(resp.result)),
            Message::Error(err) => match err.id {
                Some(id) => self.deliver(&id, Err(err.error)),
                None => warn!(
                    code = err.error.code,
                    message = %err.error.message,
                    "Peer reported an error without a request id"
                ),
            },
            Message::Notification(notification) => {
                self.handle_notification(notification, service).await;
            }
            Message::Request(request) => self.handle_request(request, service),
        }
    }

    fn deliver(&self, id: &RequestId, outcome: Result<Value, JsonRpcErrorData>) {
        match self.inner.correlator.complete(id, outcome) {
            Delivery::Delivered { method, elapsed } => {
                debug!(
                    id = %id,
                    method = %method,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Reply delivered"
                );
            }
            Delivery::Late(CallState::Completed | CallState::Failed) => {
                warn!(id = %id, "Discarding duplicate reply");
            }
            Delivery::Late(state) => {
                debug!(id = %id, state = %state, "Discarding late reply");
            }
            Delivery::Unknown => {
                warn!(id = %id, "Discarding reply for unknown request");
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        service: &Arc<dyn Service>,
    ) {
        debug!(method = %notification.method, "Received notification");

        if notification.method == methods::CANCELLED {
            self.cancel_inbound(&notification);
        }

        service.handle_notification(self, &notification).await;

        // The listener task only stops at shutdown.
        let _ = self.inner.notifications.send(notification);
    }

    fn cancel_inbound(&self, notification: &JsonRpcNotification) {
        let params = notification
            .params
            .clone()
            .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
        let Some(params) = params else {
            warn!("Ignoring malformed cancellation notification");
            return;
        };

        let handle = self.inflight().remove(&params.request_id);
        match handle {
            Some(handle) => {
                handle.abort();
                info!(
                    id = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or("none"),
                    "Peer cancelled in-flight request"
                );
            }
            None => debug!(
                id = %params.request_id,
                "Cancellation for a request that is not in flight"
            ),
        }
    }

    fn handle_request(&self, request: JsonRpcRequest, service: &Arc<dyn Service>) {
        if let Err(state) = self.inner.session.admit(&request.method) {
            warn!(
                id = %request.id,
                method = %request.method,
                state = %state,
                "Rejecting request, session not ready"
            );
            let message = format!(
                "Session not ready: {} is not allowed while the session is {state}",
                request.method
            );
            self.reply(request.id, Err(JsonRpcErrorData::invalid_request(message)));
            return;
        }

        let mut inflight = self.inflight();
        if inflight.contains_key(&request.id) {
            drop(inflight);
            warn!(id = %request.id, "Rejecting request with an id already in flight");
            self.reply(
                request.id,
                Err(JsonRpcErrorData::invalid_request("Request id is already in flight")),
            );
            return;
        }

        debug!(id = %request.id, method = %request.method, "Dispatching request");

        let id = request.id.clone();
        let peer = self.clone();
        let service = Arc::clone(service);
        let task = tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();
            let ctx = RequestContext {
                id: id.clone(),
                peer: peer.clone(),
            };

            let outcome = AssertUnwindSafe(service.handle_request(ctx, request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(id = %id, method = %method, "Request handler panicked");
                    Err(JsonRpcErrorData::internal("Request handler panicked"))
                });

            // A missing entry means the request was cancelled meanwhile.
            let still_wanted = peer.inflight().remove(&id).is_some();
            if still_wanted {
                peer.reply(id, outcome);
            }
        });
        inflight.insert(id, task.abort_handle());
    }

    async fn teardown(&self, writer: JoinHandle<()>) {
        let session = &self.inner.session;
        session.begin_close();

        let failed = self.inner.correlator.close();
        let aborted = {
            let mut inflight = self.inflight();
            let count = inflight.len();
            for (_, handle) in inflight.drain() {
                handle.abort();
            }
            count
        };

        self.inner.shutdown.cancel();
        if let Err(e) = writer.await {
            error!(error = %e, "Writer task failed");
        }

        session.mark_closed();
        info!(
            session = %session.id(),
            failed_requests = failed,
            aborted_handlers = aborted,
            "Session closed"
        );
    }
}

/// Handle to one outstanding outbound request.
///
/// Dropping the handle before the reply arrives cancels the request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    method: String,
    receiver: oneshot::Receiver<CallResult>,
    timeout: Option<Duration>,
    peer: PeerHandle,
    settled: bool,
}

impl PendingRequest {
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Waits for the reply, honouring the request's deadline.
    ///
    /// # Errors
    ///
    /// - [`McpError::Remote`] if the peer replied with an error
    /// - [`McpError::TimedOut`] if the deadline elapsed first
    /// - [`McpError::Cancelled`] if the request was cancelled
    /// - [`McpError::Closed`] if the session closed first
    pub async fn wait(mut self) -> Result<Value, McpError> {
        let outcome = match self.timeout {
            None => (&mut self.receiver).await.unwrap_or(Err(McpError::Closed)),
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(received) => received.unwrap_or(Err(McpError::Closed)),
                Err(_) => self.expire(limit),
            },
        };
        self.settled = true;
        outcome
    }

    fn expire(&mut self, limit: Duration) -> Result<Value, McpError> {
        let timed_out = || McpError::TimedOut {
            id: self.id.clone(),
            after: limit,
        };

        if self
            .peer
            .correlator()
            .settle(&self.id, CallState::TimedOut, timed_out())
        {
            warn!(id = %self.id, method = %self.method, after = ?limit, "Request timed out");
            self.peer.send_cancellation(&self.id, Some("request timed out"));
            return Err(timed_out());
        }

        // Settled between the deadline firing and now; take that outcome.
        self.receiver.try_recv().unwrap_or_else(|_| Err(timed_out()))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.peer.correlator().cancel(&self.id) {
            debug!(id = %self.id, method = %self.method, "Request abandoned by caller");
            self.peer.send_cancellation(&self.id, Some("request abandoned"));
        }
    }
}

async fn write_loop(
    mut sink: Box<dyn MessageSink>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv() => message,
            () = shutdown.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = sink.send(message).await {
            error!(error = %e, "Failed to write message, closing session");
            shutdown.cancel();
            break;
        }
    }

    // Flush what was queued before shutdown, such as final replies.
    while let Ok(message) = queue.try_recv() {
        if sink.send(message).await.is_err() {
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error closing transport");
    }
}

async fn read_loop(
    peer: PeerHandle,
    mut incoming: MessageStream,
    service: Arc<dyn Service>,
    writer: JoinHandle<()>,
) {
    let shutdown = peer.inner.shutdown.clone();

    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => break,
            item = incoming.next() => item,
        };

        match item {
            None => {
                debug!(session = %peer.session().id(), "Incoming stream ended");
                break;
            }
            Some(Err(frame_error)) => peer.reject_frame(&frame_error),
            Some(Ok(message)) => peer.dispatch(message, &service).await,
        }
    }

    peer.teardown(writer).await;
}

async fn listener_loop(
    peer: PeerHandle,
    mut queue: mpsc::UnboundedReceiver<JsonRpcNotification>,
) {
    let shutdown = peer.inner.shutdown.clone();

    loop {
        let notification = tokio::select! {
            notification = queue.recv() => notification,
            () = shutdown.cancelled() => None,
        };
        let Some(notification) = notification else {
            break;
        };

        for listener in peer.listeners_for(&notification.method) {
            if let Err(e) = listener.on_notification(notification.clone()).await {
                warn!(
                    method = %notification.method,
                    error = %e,
                    "Notification listener failed"
                );
            }
        }
    }
}

//! HTTP transport, server side.
//!
//! Routes:
//!
//! - `POST /mcp` — one client-to-server message per request. An
//!   `initialize` request without an `Mcp-Session-Id` header opens a
//!   session; the response carries the new ID. Requests are answered in the
//!   POST response when the reply is ready within the reply timeout,
//!   otherwise with `202 Accepted` and the reply arrives on the event
//!   stream. Notifications and replies are answered with `202 Accepted`.
//! - `GET /mcp` — the session's Server-Sent Events stream. A
//!   `Last-Event-ID` header resumes after that event; `410 Gone` means the
//!   requested history is no longer available. A session has at most one
//!   open stream: a new GET ends the previous one.
//! - `DELETE /mcp` — closes the session.
//! - `GET /health` — liveness probe.
//!
//! The `Authorization` header of the opening request is attached to the
//! session as an opaque credential.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventLog, StoredEvent};
use super::{Channel, MessageSink};
use crate::mcp::error::TransportError;
use crate::mcp::framing::FrameError;
use crate::mcp::peer::PeerHandle;
use crate::mcp::protocol::{self, methods, JsonRpcError, Message, RequestId};
use crate::mcp::server::McpServer;
use crate::mcp::session::Credential;

/// Header carrying the session ID.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Header carrying the resume cursor.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Path of the message endpoint.
pub const MCP_PATH: &str = "/mcp";

/// HTTP transport settings.
#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    /// Unacknowledged events kept per session.
    pub event_buffer: usize,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// How long a POST waits for a reply before answering 202.
    pub reply_timeout: Duration,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            max_sessions: 100,
            reply_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(15),
        }
    }
}

type Waiters = Mutex<HashMap<RequestId, oneshot::Sender<Message>>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Message>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HttpSession {
    peer: PeerHandle,
    inbound: mpsc::UnboundedSender<Result<Message, FrameError>>,
    waiters: Arc<Waiters>,
    events: Arc<EventLog>,
    stream: Mutex<Option<CancellationToken>>,
}

impl HttpSession {
    fn id(&self) -> &str {
        self.peer.session().id()
    }

    /// Installs `token` as the session's only live stream, ending the one
    /// it replaces. Returns `true` if a previous stream was ended.
    fn replace_stream(&self, token: CancellationToken) -> bool {
        let previous = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token);
        previous.is_some_and(|old| {
            let live = !old.is_cancelled();
            old.cancel();
            live
        })
    }
}

/// Outbound side of an HTTP session: replies go to the waiting POST when
/// there is one, everything else is appended to the event log.
struct SessionSink {
    waiters: Arc<Waiters>,
    events: Arc<EventLog>,
}

impl SessionSink {
    fn try_direct(&self, message: Message) -> Option<Message> {
        let id = match &message {
            Message::Response(resp) => resp.id.clone(),
            Message::Error(JsonRpcError { id: Some(id), .. }) => id.clone(),
            _ => return Some(message),
        };

        let waiter = lock(&self.waiters).remove(&id);
        match waiter {
            Some(waiter) => waiter.send(message).err(),
            None => Some(message),
        }
    }
}

#[async_trait]
impl MessageSink for SessionSink {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let Some(message) = self.try_direct(message) else {
            return Ok(());
        };

        let data = protocol::to_json(&message)?;
        let event_id = self.events.push(data);
        debug!(event_id, kind = message.kind(), "Queued event");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.events.close();
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    server: McpServer,
    sessions: Arc<RwLock<HashMap<String, Arc<HttpSession>>>>,
    options: Arc<HttpServerOptions>,
    shutdown: CancellationToken,
}

impl AppState {
    fn new(server: McpServer, options: HttpServerOptions) -> Self {
        Self {
            server,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            options: Arc::new(options),
            shutdown: CancellationToken::new(),
        }
    }

    async fn session(&self, id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn open_session(&self, credential: Option<Credential>) -> Result<Arc<HttpSession>, Response> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.options.max_sessions {
            warn!(limit = self.options.max_sessions, "Refusing new session, limit reached");
            return Err((StatusCode::SERVICE_UNAVAILABLE, "Too many sessions").into_response());
        }

        let (inbound, queue) = mpsc::unbounded_channel();
        let waiters = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventLog::new(self.options.event_buffer));
        let channel = Channel::new(
            UnboundedReceiverStream::new(queue).boxed(),
            Box::new(SessionSink {
                waiters: Arc::clone(&waiters),
                events: Arc::clone(&events),
            }),
        );

        let peer = self.server.serve(channel, credential);
        let session = Arc::new(HttpSession {
            peer,
            inbound,
            waiters,
            events,
            stream: Mutex::new(None),
        });
        let id = session.id().to_string();
        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);

        info!(session = %id, "HTTP session opened");

        // Forget the session once its peer has shut down.
        let registry = Arc::clone(&self.sessions);
        let peer = session.peer.clone();
        tokio::spawn(async move {
            peer.closed().await;
            registry.write().await.remove(&id);
            debug!(session = %id, "HTTP session removed");
        });

        Ok(session)
    }
}

/// Builds the router for `server`.
pub fn router(server: McpServer, options: HttpServerOptions) -> Router {
    build_router(AppState::new(server, options))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            MCP_PATH,
            get(open_events).post(post_message).delete(close_session),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Serves `server` on `listener` until `shutdown` resolves.
///
/// On shutdown, open event streams are ended and every session is closed.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve<F>(
    server: McpServer,
    options: HttpServerOptions,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(server, options);
    let sessions = Arc::clone(&state.sessions);
    let stop = state.shutdown.clone();
    let app = build_router(state);

    info!(addr = ?listener.local_addr().ok(), "HTTP transport listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            stop.cancel();
        })
        .await?;

    let open: Vec<_> = sessions.write().await.drain().map(|(_, s)| s).collect();
    for session in open {
        session.peer.close().await;
    }

    info!("HTTP transport stopped");
    Ok(())
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn credential(headers: &HeaderMap) -> Option<Credential> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(Credential::new)
}

fn with_session(mut response: Response, session: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn rpc_response(status: StatusCode, message: &Message) -> Response {
    (status, Json(message)).into_response()
}

fn unknown_session() -> Response {
    (StatusCode::NOT_FOUND, "Unknown session").into_response()
}

async fn post_message(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let message = match protocol::parse_message(&body) {
        Ok(message) => message,
        Err(reply) => {
            warn!(code = reply.error.code, "Rejecting malformed POST body");
            return rpc_response(StatusCode::BAD_REQUEST, &Message::Error(reply));
        }
    };

    let session = match session_header(&headers) {
        Some(id) => {
            let found = state.session(id).await;
            match found {
                Some(session) => session,
                None => return unknown_session(),
            }
        }
        None if matches!(&message, Message::Request(r) if r.method == methods::INITIALIZE) => {
            match state.open_session(credential(&headers)).await {
                Ok(session) => session,
                Err(response) => return response,
            }
        }
        None => {
            let reply = JsonRpcError::invalid_request(
                message.id().cloned(),
                "Missing Mcp-Session-Id header",
            );
            return rpc_response(StatusCode::BAD_REQUEST, &Message::Error(reply));
        }
    };

    let Message::Request(request) = message else {
        if session.inbound.send(Ok(message)).is_err() {
            return (StatusCode::GONE, "Session closed").into_response();
        }
        return with_session(StatusCode::ACCEPTED.into_response(), session.id());
    };

    let id = request.id.clone();
    let (tx, rx) = oneshot::channel();
    {
        let mut waiters = lock(&session.waiters);
        if waiters.contains_key(&id) {
            warn!(session = %session.id(), id = %id, "Rejecting request with an id already in flight");
            let reply = JsonRpcError::invalid_request(Some(id), "Request id is already in flight");
            return with_session(
                rpc_response(StatusCode::BAD_REQUEST, &Message::Error(reply)),
                session.id(),
            );
        }
        waiters.insert(id.clone(), tx);
    }

    if session.inbound.send(Ok(Message::Request(request))).is_err() {
        lock(&session.waiters).remove(&id);
        return (StatusCode::GONE, "Session closed").into_response();
    }

    match tokio::time::timeout(state.options.reply_timeout, rx).await {
        Ok(Ok(reply)) => with_session(rpc_response(StatusCode::OK, &reply), session.id()),
        _ => {
            lock(&session.waiters).remove(&id);
            debug!(session = %session.id(), id = %id, "Reply deferred to the event stream");
            with_session(StatusCode::ACCEPTED.into_response(), session.id())
        }
    }
}

async fn open_events(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = state.session(id).await else {
        return unknown_session();
    };

    let cursor = match headers.get(LAST_EVENT_ID_HEADER) {
        None => 0,
        Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(cursor) => cursor,
            None => return (StatusCode::BAD_REQUEST, "Invalid Last-Event-ID").into_response(),
        },
    };

    if cursor > 0 {
        session.events.acknowledge(cursor);
    }

    if let Err(expired) = session.events.since(cursor) {
        warn!(session = %id, cursor, error = %expired, "Refusing stale resume cursor");
        let body = json!({
            "error": expired.to_string(),
            "prunedThrough": expired.pruned_through,
        });
        return (StatusCode::GONE, Json(body)).into_response();
    }

    let token = state.shutdown.child_token();
    if session.replace_stream(token.clone()) {
        info!(session = %id, "Ending previous event stream in favour of a new one");
    }
    info!(session = %id, cursor, "Event stream opened");

    let stream = event_stream(Arc::clone(&session.events), cursor, token);
    let keep_alive = KeepAlive::new()
        .interval(state.options.keep_alive)
        .text("keep-alive");
    with_session(Sse::new(stream).keep_alive(keep_alive).into_response(), id)
}

/// Streams events after `cursor`, waiting for new ones, until the log is
/// closed or `stop` is cancelled. Yielded events are marked delivered.
fn event_stream(
    log: Arc<EventLog>,
    cursor: u64,
    stop: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let updates = log.subscribe();
    let pending: Vec<StoredEvent> = Vec::new();

    stream::unfold(
        (log, cursor, updates, pending),
        |(log, mut cursor, mut updates, mut pending)| async move {
            loop {
                if !pending.is_empty() {
                    let event = pending.remove(0);
                    cursor = event.id;
                    log.mark_delivered(event.id);
                    let sse = Event::default()
                        .id(event.id.to_string())
                        .event("message")
                        .data(event.data);
                    return Some((Ok(sse), (log, cursor, updates, pending)));
                }

                match log.since(cursor) {
                    Ok(events) if !events.is_empty() => pending = events,
                    Ok(_) if log.is_closed() => return None,
                    Ok(_) => {
                        if updates.changed().await.is_err() {
                            return None;
                        }
                    }
                    Err(expired) => {
                        warn!(error = %expired, "Event stream fell behind the buffer");
                        return None;
                    }
                }
            }
        },
    )
    .take_until(async move { stop.cancelled().await })
}

async fn close_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };

    let removed = state.sessions.write().await.remove(id);
    match removed {
        Some(session) => {
            session.peer.close().await;
            info!(session = %id, "HTTP session closed by client");
            StatusCode::NO_CONTENT.into_response()
        }
        None => unknown_session(),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.sessions.read().await.len();
    Json(json!({
        "status": "ok",
        "sessions": sessions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcErrorData, JsonRpcNotification, JsonRpcResponse};
    use serde_json::Value;

    fn sink() -> (SessionSink, Arc<Waiters>, Arc<EventLog>) {
        let waiters = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventLog::new(16));
        (
            SessionSink {
                waiters: Arc::clone(&waiters),
                events: Arc::clone(&events),
            },
            waiters,
            events,
        )
    }

    #[tokio::test]
    async fn reply_goes_to_waiting_post() {
        let (mut sink, waiters, events) = sink();
        let (tx, rx) = oneshot::channel();
        lock(&waiters).insert(RequestId::Number(1), tx);

        let reply = Message::Response(JsonRpcResponse::success(RequestId::Number(1), Value::Null));
        sink.send(reply.clone()).await.unwrap();

        assert_eq!(rx.await.unwrap(), reply);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn reply_without_waiter_goes_to_event_log() {
        let (mut sink, waiters, events) = sink();
        let (tx, rx) = oneshot::channel();
        lock(&waiters).insert(RequestId::Number(2), tx);
        drop(rx);

        let reply = Message::Error(JsonRpcError::new(
            Some(RequestId::Number(2)),
            JsonRpcErrorData::internal("boom"),
        ));
        sink.send(reply).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn notifications_always_go_to_event_log() {
        let (mut sink, _waiters, events) = sink();
        sink.send(JsonRpcNotification::new("notifications/tools/list_changed", None).into())
            .await
            .unwrap();

        let stored = events.since(0).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].data.contains("list_changed"));

        sink.close().await.unwrap();
        assert!(events.is_closed());
    }

    #[tokio::test]
    async fn event_stream_replays_then_ends_on_close() {
        let log = Arc::new(EventLog::new(16));
        log.push("{\"n\":1}".to_string());
        log.push("{\"n\":2}".to_string());
        log.close();

        let events: Vec<_> = event_stream(Arc::clone(&log), 1, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn streamed_events_count_as_delivered() {
        let log = Arc::new(EventLog::new(1));
        log.push("{\"n\":1}".to_string());
        log.close();

        let events: Vec<_> = event_stream(Arc::clone(&log), 0, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events.len(), 1);

        log.push("{\"n\":2}".to_string());
        assert_eq!(log.lost(), 0);
    }

    #[tokio::test]
    async fn cancelled_stream_stops_yielding() {
        let log = Arc::new(EventLog::new(4));
        let stop = CancellationToken::new();
        stop.cancel();
        log.push("{\"n\":1}".to_string());

        let events: Vec<_> = event_stream(log, 0, stop).collect().await;
        assert!(events.is_empty());
    }

    #[test]
    fn credential_comes_from_authorization() {
        let mut headers = HeaderMap::new();
        assert!(credential(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(credential(&headers).unwrap().expose(), "Bearer abc");
    }
}

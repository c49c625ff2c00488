//! HTTP transport, client side.
//!
//! Each outbound message is one POST. The first reply carrying an
//! `Mcp-Session-Id` header adopts that session and opens the event stream,
//! which is reconnected with exponential backoff and resumed from the last
//! event ID seen, so no event is delivered twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{SseDecoder, SseEvent};
use super::http_server::{LAST_EVENT_ID_HEADER, SESSION_HEADER};
use super::{Channel, MessageSink};
use crate::mcp::error::TransportError;
use crate::mcp::framing::FrameError;
use crate::mcp::protocol::{self, Message};
use crate::mcp::session::Credential;

/// Backoff for event stream reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the channel is closed.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

/// Builder for the client side of the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpClientTransport {
    client: reqwest::Client,
    url: String,
    credential: Option<Credential>,
    reconnect: ReconnectPolicy,
}

impl HttpClientTransport {
    /// Targets the message endpoint at `url` (for example
    /// `http://127.0.0.1:8808/mcp`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: url.into(),
            credential: None,
            reconnect: ReconnectPolicy::default(),
        })
    }

    /// Sends `credential` as the `Authorization` header.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Turns the transport into a channel. Nothing is sent until the first
    /// outbound message.
    #[must_use]
    pub fn connect(self) -> Channel {
        let (incoming, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            client: self.client,
            url: self.url,
            credential: self.credential,
            reconnect: self.reconnect,
            session_id: Mutex::new(None),
            cursor: AtomicU64::new(0),
            incoming,
            shutdown: CancellationToken::new(),
        });

        let stop = shared.shutdown.clone();
        let stream = UnboundedReceiverStream::new(queue)
            .take_until(async move { stop.cancelled().await })
            .boxed();

        Channel::new(stream, Box::new(HttpSink { shared }))
    }
}

struct Shared {
    client: reqwest::Client,
    url: String,
    credential: Option<Credential>,
    reconnect: ReconnectPolicy,
    session_id: Mutex<Option<String>>,
    cursor: AtomicU64,
    incoming: mpsc::UnboundedSender<Result<Message, FrameError>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn session_id(&self) -> MutexGuard<'_, Option<String>> {
        self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(id) = self.session_id().clone() {
            builder = builder.header(SESSION_HEADER, id);
        }
        if let Some(credential) = &self.credential {
            builder = builder.header(AUTHORIZATION, credential.expose());
        }
        builder
    }

    fn deliver(&self, item: Result<Message, FrameError>) {
        // Only fails once the channel has been dropped.
        let _ = self.incoming.send(item);
    }

    fn deliver_body(&self, body: &str) {
        match protocol::parse_message(body) {
            Ok(message) => self.deliver(Ok(message)),
            Err(reply) => {
                warn!(code = reply.error.code, "Server sent an unreadable message");
                self.deliver(Err(FrameError::Malformed(reply)));
            }
        }
    }

    /// Handles one event from the stream. Returns `false` for events at or
    /// below the cursor, which were already delivered.
    fn deliver_event(&self, event: &SseEvent) -> bool {
        if let Some(id) = event.id.as_deref().and_then(|id| id.parse::<u64>().ok()) {
            if id <= self.cursor.load(Ordering::Acquire) {
                debug!(event_id = id, "Skipping already delivered event");
                return false;
            }
            self.cursor.store(id, Ordering::Release);
        }
        self.deliver_body(&event.data);
        true
    }

    fn adopt_session(self: &Arc<Self>, headers: &HeaderMap) {
        let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
            return;
        };

        let mut current = self.session_id();
        if current.is_some() {
            return;
        }
        *current = Some(id.to_string());
        drop(current);

        info!(session = %id, "HTTP session established");
        tokio::spawn(listen(Arc::clone(self)));
    }

    async fn post(self: &Arc<Self>, message: &Message) -> Result<(), TransportError> {
        let body = protocol::to_json(message)?;
        let response = self
            .request(self.client.post(&self.url))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body)
            .send()
            .await?;

        self.adopt_session(response.headers());

        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let text = response.text().await?;
        if status.is_success() {
            if !text.trim().is_empty() {
                self.deliver_body(&text);
            }
            return Ok(());
        }

        // Protocol errors come back as JSON-RPC errors with a 4xx status.
        if let Some(reply) = error_reply(message, &text) {
            warn!(status = %status, "Server rejected posted message");
            self.deliver(Ok(reply));
            return Ok(());
        }

        Err(TransportError::Status {
            status: status.as_u16(),
            message: text,
        })
    }

    async fn delete_session(&self) {
        let Some(id) = self.session_id().take() else {
            return;
        };

        let mut builder = self.client.delete(&self.url).header(SESSION_HEADER, &id);
        if let Some(credential) = &self.credential {
            builder = builder.header(AUTHORIZATION, credential.expose());
        }
        match builder.send().await {
            Ok(response) => debug!(session = %id, status = %response.status(), "Session deleted"),
            Err(e) => debug!(session = %id, error = %e, "Could not delete session"),
        }
    }
}

/// Reads a JSON-RPC error out of a rejected POST body. An error the server
/// could not tie to an id (a parse error, say) belongs to the request that
/// was posted, so that caller fails at once instead of timing out.
fn error_reply(posted: &Message, body: &str) -> Option<Message> {
    let Ok(Message::Error(mut reply)) = protocol::parse_message(body) else {
        return None;
    };
    if reply.id.is_none() {
        reply.id = posted.id().cloned();
    }
    Some(Message::Error(reply))
}

struct HttpSink {
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageSink for HttpSink {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        // A request's POST may be held open until its reply is ready, so it
        // must not block the writer.
        if matches!(message, Message::Request(_)) {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = shared.post(&message).await {
                    error!(error = %e, "Failed to post request, closing channel");
                    shared.shutdown.cancel();
                }
            });
            return Ok(());
        }

        self.shared.post(&message).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.delete_session().await;
        self.shared.shutdown.cancel();
        Ok(())
    }
}

enum StreamError {
    /// The session is gone; reconnecting cannot help.
    Fatal(TransportError),
    Transient(TransportError),
}

async fn stream_events(shared: &Shared, attempt: &mut u32) -> Result<(), StreamError> {
    let mut builder = shared
        .request(shared.client.get(&shared.url))
        .header(ACCEPT, "text/event-stream");
    let cursor = shared.cursor.load(Ordering::Acquire);
    if cursor > 0 {
        builder = builder.header(LAST_EVENT_ID_HEADER, cursor.to_string());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| StreamError::Transient(e.into()))?;

    let status = response.status();
    if !status.is_success() {
        let error = TransportError::Status {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        };
        return Err(if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            StreamError::Fatal(error)
        } else {
            StreamError::Transient(error)
        });
    }

    *attempt = 0;
    info!(cursor, "Event stream connected");

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            () = shared.shutdown.cancelled() => return Ok(()),
            chunk = body.next() => chunk,
        };
        match chunk {
            None => return Ok(()),
            Some(Err(e)) => return Err(StreamError::Transient(e.into())),
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    shared.deliver_event(&event);
                }
            }
        }
    }
}

async fn listen(shared: Arc<Shared>) {
    let policy = shared.reconnect.clone();
    let mut attempt = 0u32;

    loop {
        let outcome = stream_events(&shared, &mut attempt).await;
        if shared.shutdown.is_cancelled() {
            break;
        }

        match outcome {
            Ok(()) => debug!("Event stream ended, reconnecting"),
            Err(StreamError::Fatal(e)) => {
                error!(error = %e, "Event stream rejected, closing channel");
                shared.shutdown.cancel();
                break;
            }
            Err(StreamError::Transient(e)) => warn!(error = %e, "Event stream failed"),
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            error!(attempts = policy.max_attempts, "Giving up on event stream");
            shared.shutdown.cancel();
            break;
        }

        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Reconnecting event stream");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.shutdown.cancelled() => break,
        }
    }

    debug!("Event stream listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<Result<Message, FrameError>>) {
        let (incoming, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            client: reqwest::Client::new(),
            url: "http://127.0.0.1:9/mcp".to_string(),
            credential: None,
            reconnect: ReconnectPolicy::default(),
            session_id: Mutex::new(None),
            cursor: AtomicU64::new(0),
            incoming,
            shutdown: CancellationToken::new(),
        });
        (shared, queue)
    }

    fn event(id: &str) -> SseEvent {
        SseEvent {
            id: Some(id.to_string()),
            event: Some("message".to_string()),
            data: r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#.to_string(),
        }
    }

    #[test]
    fn replayed_events_are_skipped() {
        let (shared, mut queue) = shared();

        assert!(shared.deliver_event(&event("1")));
        assert!(shared.deliver_event(&event("2")));
        // A reconnect replays from the cursor; anything older is dropped.
        assert!(!shared.deliver_event(&event("2")));
        assert!(shared.deliver_event(&event("3")));

        let mut delivered = 0;
        while queue.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
        assert_eq!(shared.cursor.load(Ordering::Acquire), 3);
    }

    #[test]
    fn unreadable_event_is_a_frame_error() {
        let (shared, mut queue) = shared();
        shared.deliver_event(&SseEvent {
            id: Some("1".to_string()),
            event: None,
            data: "not json".to_string(),
        });
        assert!(matches!(queue.try_recv(), Ok(Err(FrameError::Malformed(_)))));
    }

    #[test]
    fn id_less_error_is_attributed_to_the_posted_request() {
        use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};

        let posted: Message = JsonRpcRequest::new(RequestId::Number(4), "tools/list", None).into();
        let body = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#;
        let Some(Message::Error(reply)) = error_reply(&posted, body) else {
            panic!("expected an error reply");
        };
        assert_eq!(reply.id, Some(RequestId::Number(4)));
        assert_eq!(reply.error.code, -32700);

        let keeps_own_id = r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32600,"message":"x"}}"#;
        let Some(Message::Error(reply)) = error_reply(&posted, keeps_own_id) else {
            panic!("expected an error reply");
        };
        assert_eq!(reply.id, Some(RequestId::Number(9)));

        let notification: Message = JsonRpcNotification::new("initialized", None).into();
        let Some(Message::Error(reply)) = error_reply(&notification, body) else {
            panic!("expected an error reply");
        };
        assert_eq!(reply.id, None);

        assert!(error_reply(&posted, "Unknown session").is_none());
    }

    #[tokio::test]
    async fn rejected_request_fails_its_caller_immediately() {
        use axum::http::StatusCode as AxumStatus;
        use axum::routing::post;
        use crate::mcp::protocol::{JsonRpcRequest, RequestId};

        let app = axum::Router::new().route(
            "/mcp",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    axum::Json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": null,
                        "error": {"code": -32700, "message": "Parse error"}
                    })),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mut channel = HttpClientTransport::new(format!("http://{addr}/mcp"))
            .unwrap()
            .connect();
        channel
            .outgoing
            .send(JsonRpcRequest::new(RequestId::Number(1), "tools/list", None).into())
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), channel.incoming.next())
            .await
            .expect("rejection was not surfaced")
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), Some(&RequestId::Number(1)));
        assert!(matches!(reply, Message::Error(_)));
    }

    #[tokio::test]
    async fn closed_sink_refuses_messages() {
        let mut channel = HttpClientTransport::new("http://127.0.0.1:9/mcp")
            .unwrap()
            .connect();
        channel.outgoing.close().await.unwrap();

        let result = channel
            .outgoing
            .send(crate::mcp::protocol::JsonRpcNotification::new("initialized", None).into())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(channel.incoming.next().await.is_none());
    }
}

//! Session lifecycle and negotiated state.
//!
//! A session moves through `Created -> Initializing -> Ready -> Closing ->
//! Closed`. Only `initialize` may cross the wire before `Ready`; the peer
//! loop asks [`Session::admit`] before dispatching or sending anything else.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;

use super::capability::{CapabilitySet, Operation};
use super::protocol::methods;
use super::types::Implementation;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, nothing exchanged.
    Created,
    /// `initialize` is in flight.
    Initializing,
    /// Negotiation finished; normal traffic allowed.
    Ready,
    /// Teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Opaque credential attached to a connection.
///
/// The runtime never inspects the value and never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// Reads a credential from an environment variable, if set and non-empty.
    #[must_use]
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    /// Returns the raw value, for handing to a backend.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Outcome of a successful `initialize` exchange.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// The protocol version both sides agreed on.
    pub protocol_version: String,
    /// Capabilities this side advertised.
    pub local: CapabilitySet,
    /// Capabilities the peer advertised.
    pub remote: CapabilitySet,
    /// Name and version the peer reported, if any.
    pub peer_info: Option<Implementation>,
}

/// Returns the major component of a version string (`"1.4"` -> `"1"`).
#[must_use]
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version).trim()
}

/// Two versions are compatible when their major components match.
#[must_use]
pub fn versions_compatible(a: &str, b: &str) -> bool {
    !major_version(a).is_empty() && major_version(a) == major_version(b)
}

/// Per-connection session state.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: watch::Sender<SessionState>,
    negotiated: OnceLock<Negotiated>,
    credential: Option<Credential>,
}

impl Session {
    /// Creates a session with a fresh random ID.
    #[must_use]
    pub fn new(credential: Option<Credential>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), credential)
    }

    /// Creates a session with a caller-chosen ID.
    #[must_use]
    pub fn with_id(id: impl Into<String>, credential: Option<Credential>) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id: id.into(),
            state,
            negotiated: OnceLock::new(),
            credential,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// The credential supplied for this connection, if any.
    #[must_use]
    pub const fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Negotiated parameters, once `initialize` has succeeded.
    #[must_use]
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.get()
    }

    /// Returns `true` if the peer advertised `operation`.
    #[must_use]
    pub fn peer_supports(&self, operation: Operation) -> bool {
        self.negotiated()
            .is_some_and(|n| n.remote.supports(operation))
    }

    /// Returns `true` if this side advertised `operation`.
    #[must_use]
    pub fn local_supports(&self, operation: Operation) -> bool {
        self.negotiated()
            .is_some_and(|n| n.local.supports(operation))
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// `Created -> Initializing`.
    ///
    /// # Errors
    ///
    /// Returns the current state if the session is past `Created`.
    pub fn begin_initialize(&self) -> Result<(), SessionState> {
        if self.transition(&[SessionState::Created], SessionState::Initializing) {
            Ok(())
        } else {
            Err(self.state())
        }
    }

    /// `Initializing -> Created`, after a failed handshake.
    pub fn abort_initialize(&self) {
        self.transition(&[SessionState::Initializing], SessionState::Created);
    }

    /// Records the negotiated parameters. Only the first call takes effect.
    pub fn complete_negotiation(&self, negotiated: Negotiated) -> bool {
        self.negotiated.set(negotiated).is_ok()
    }

    /// `Initializing -> Ready`.
    pub fn mark_ready(&self) -> bool {
        self.transition(&[SessionState::Initializing], SessionState::Ready)
    }

    /// Any live state `-> Closing`.
    pub fn begin_close(&self) -> bool {
        self.transition(
            &[
                SessionState::Created,
                SessionState::Initializing,
                SessionState::Ready,
            ],
            SessionState::Closing,
        )
    }

    /// Terminal transition.
    pub fn mark_closed(&self) {
        self.state.send_replace(SessionState::Closed);
    }

    /// Checks whether a request for `method` may be exchanged now.
    ///
    /// `initialize` is always admitted so the handler can answer it
    /// properly; everything else waits for `Ready`.
    ///
    /// # Errors
    ///
    /// Returns the current state when the method is not allowed.
    pub fn admit(&self, method: &str) -> Result<(), SessionState> {
        let state = self.state();
        match state {
            SessionState::Ready => Ok(()),
            SessionState::Created | SessionState::Initializing
                if method == methods::INITIALIZE =>
            {
                Ok(())
            }
            _ => Err(state),
        }
    }

    /// Waits until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only fails if the session is gone.
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_happy_path() {
        let session = Session::new(None);
        assert_eq!(session.state(), SessionState::Created);

        session.begin_initialize().unwrap();
        assert_eq!(session.state(), SessionState::Initializing);
        assert!(session.mark_ready());
        assert!(session.is_ready());

        assert!(session.begin_close());
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn second_initialize_is_refused() {
        let session = Session::new(None);
        session.begin_initialize().unwrap();
        assert_eq!(
            session.begin_initialize(),
            Err(SessionState::Initializing)
        );
    }

    #[test]
    fn aborted_initialize_returns_to_created() {
        let session = Session::new(None);
        session.begin_initialize().unwrap();
        session.abort_initialize();
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.begin_initialize().is_ok());
    }

    #[test]
    fn only_initialize_is_admitted_before_ready() {
        let session = Session::new(None);
        assert!(session.admit("initialize").is_ok());
        assert_eq!(session.admit("tools/list"), Err(SessionState::Created));
        assert_eq!(session.admit("ping"), Err(SessionState::Created));

        session.begin_initialize().unwrap();
        assert_eq!(
            session.admit("tools/call"),
            Err(SessionState::Initializing)
        );

        session.mark_ready();
        assert!(session.admit("tools/call").is_ok());

        session.begin_close();
        assert_eq!(session.admit("tools/call"), Err(SessionState::Closing));
        assert!(session.admit("initialize").is_err());
    }

    #[test]
    fn negotiation_is_recorded_once() {
        let session = Session::new(None);
        let caps: CapabilitySet = serde_json::from_value(json!({"tools": {}})).unwrap();
        let negotiated = Negotiated {
            protocol_version: "1.0".to_string(),
            local: CapabilitySet::new(),
            remote: caps,
            peer_info: None,
        };

        assert!(session.complete_negotiation(negotiated.clone()));
        assert!(!session.complete_negotiation(negotiated));
        assert!(session.peer_supports(Operation::CallTool));
        assert!(!session.local_supports(Operation::CallTool));
    }

    #[test]
    fn credential_is_redacted() {
        let credential = Credential::new("sk-very-secret");
        assert_eq!(format!("{credential:?}"), "Credential(<redacted>)");
        assert_eq!(credential.expose(), "sk-very-secret");

        let session = Session::new(Some(credential));
        assert!(!format!("{session:?}").contains("sk-very-secret"));
    }

    #[test]
    fn version_compatibility_uses_major_component() {
        assert!(versions_compatible("1.0", "1.3"));
        assert!(versions_compatible("2", "2.1"));
        assert!(!versions_compatible("2.0", "1.0"));
        assert!(!versions_compatible("", "1.0"));
        assert_eq!(major_version("10.2.1"), "10");
    }

    #[tokio::test]
    async fn closed_resolves_after_mark_closed() {
        let session = Arc::new(Session::new(None));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };
        session.begin_close();
        session.mark_closed();
        waiter.await.unwrap();
    }
}

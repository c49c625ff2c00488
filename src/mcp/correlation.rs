//! Request/response correlation.
//!
//! Every outbound request gets an entry in the pending table keyed by its
//! ID. A reply removes the entry and resolves the caller exactly once.
//! Terminal states are remembered for a bounded number of IDs so that late
//! or duplicate replies can be told apart from replies nobody asked for;
//! both are discarded.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::McpError;
use super::protocol::{JsonRpcErrorData, RequestId};

/// How many settled request IDs are remembered for late-reply detection.
const SETTLED_MEMORY: usize = 1024;

/// Lifecycle of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Sent and awaiting a reply.
    Sent,
    /// Resolved with a result.
    Completed,
    /// Resolved with a JSON-RPC error.
    Failed,
    /// The deadline elapsed first.
    TimedOut,
    /// Cancelled locally, or failed by session teardown.
    Cancelled,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What happened to an inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The reply resolved a pending call.
    Delivered {
        /// Method of the resolved call.
        method: String,
        /// Time between issue and reply.
        elapsed: Duration,
    },
    /// The call had already settled; the reply was discarded.
    Late(CallState),
    /// No call with this ID was ever seen; the reply was discarded.
    Unknown,
}

/// Value handed to the waiting caller.
pub type CallResult = Result<Value, McpError>;

/// An outstanding request awaiting its reply.
#[derive(Debug)]
struct PendingCall {
    method: String,
    issued_at: Instant,
    slot: oneshot::Sender<CallResult>,
}

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<RequestId, PendingCall>,
    settled: VecDeque<(RequestId, CallState)>,
    closed: bool,
}

impl Table {
    fn remember(&mut self, id: RequestId, state: CallState) {
        if self.settled.len() >= SETTLED_MEMORY {
            self.settled.pop_front();
        }
        self.settled.push_back((id, state));
    }

    fn settled_state(&self, id: &RequestId) -> Option<CallState> {
        self.settled
            .iter()
            .rev()
            .find(|(settled, _)| settled == id)
            .map(|(_, state)| *state)
    }
}

/// Tracks outbound requests and matches replies to them.
#[derive(Debug, Default)]
pub struct Correlator {
    next_id: AtomicI64,
    discarded: AtomicU64,
    table: Mutex<Table>,
}

impl Correlator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new outbound request.
    ///
    /// When `id` is `None` a fresh numeric ID is generated. Generated IDs are
    /// monotonic and never reused within the session.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::DuplicateId`] if a caller-chosen ID is still
    /// outstanding, or [`McpError::Closed`] after [`Self::close`].
    pub fn issue(
        &self,
        method: &str,
        id: Option<RequestId>,
    ) -> Result<(RequestId, oneshot::Receiver<CallResult>), McpError> {
        let mut table = self.table();
        if table.closed {
            return Err(McpError::Closed);
        }

        let id = match id {
            Some(id) => {
                if table.pending.contains_key(&id) {
                    return Err(McpError::DuplicateId(id));
                }
                id
            }
            None => loop {
                let candidate = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
                if !table.pending.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        table.settled.retain(|(settled, _)| settled != &id);

        let (slot, receiver) = oneshot::channel();
        table.pending.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                issued_at: Instant::now(),
                slot,
            },
        );

        Ok((id, receiver))
    }

    /// Resolves the pending call for `id` with a reply from the peer.
    pub fn complete(&self, id: &RequestId, outcome: Result<Value, JsonRpcErrorData>) -> Delivery {
        let mut table = self.table();

        let Some(call) = table.pending.remove(id) else {
            let state = table.settled_state(id);
            drop(table);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return state.map_or(Delivery::Unknown, Delivery::Late);
        };

        let state = if outcome.is_ok() {
            CallState::Completed
        } else {
            CallState::Failed
        };
        table.remember(id.clone(), state);
        drop(table);

        // The caller may have stopped waiting; that is not an error here.
        let _ = call.slot.send(outcome.map_err(McpError::Remote));

        Delivery::Delivered {
            method: call.method,
            elapsed: call.issued_at.elapsed(),
        }
    }

    /// Settles a pending call locally with `error`.
    ///
    /// Returns `false` if the call had already settled.
    pub fn settle(&self, id: &RequestId, state: CallState, error: McpError) -> bool {
        let mut table = self.table();
        let Some(call) = table.pending.remove(id) else {
            return false;
        };
        table.remember(id.clone(), state);
        drop(table);

        let _ = call.slot.send(Err(error));
        true
    }

    /// Cancels a pending call. Returns `false` if it had already settled.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.settle(id, CallState::Cancelled, McpError::Cancelled { id: id.clone() })
    }

    /// Fails every pending call with [`McpError::Closed`] and refuses new ones.
    ///
    /// Returns the number of calls that were failed.
    pub fn close(&self) -> usize {
        let mut table = self.table();
        table.closed = true;
        let drained: Vec<_> = table.pending.drain().collect();
        for (id, _) in &drained {
            table.remember(id.clone(), CallState::Cancelled);
        }
        drop(table);

        let count = drained.len();
        for (_, call) in drained {
            let _ = call.slot.send(Err(McpError::Closed));
        }
        count
    }

    /// Returns the state of a call, if it is pending or recently settled.
    #[must_use]
    pub fn state(&self, id: &RequestId) -> Option<CallState> {
        let table = self.table();
        if table.pending.contains_key(id) {
            Some(CallState::Sent)
        } else {
            table.settled_state(id)
        }
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table().pending.len()
    }

    /// Number of inbound replies that matched no pending call.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn reply_wakes_the_waiting_caller() {
        let correlator = Correlator::new();
        let (id, receiver) = correlator.issue("ping", None).unwrap();

        let mut waiting = tokio_test::task::spawn(receiver);
        assert_pending!(waiting.poll());

        correlator.complete(&id, Ok(json!({})));
        assert!(waiting.is_woken());
        let outcome = assert_ready!(waiting.poll());
        assert_eq!(outcome.unwrap().unwrap(), json!({}));
    }

    #[test]
    fn generated_ids_are_monotonic() {
        let correlator = Correlator::new();
        let (a, _ra) = correlator.issue("ping", None).unwrap();
        let (b, _rb) = correlator.issue("ping", None).unwrap();
        assert_eq!(a, RequestId::Number(1));
        assert_eq!(b, RequestId::Number(2));
        assert_eq!(correlator.outstanding(), 2);
    }

    #[test]
    fn generated_ids_skip_caller_chosen_ones() {
        let correlator = Correlator::new();
        let (_, _r1) = correlator.issue("x", Some(RequestId::Number(1))).unwrap();
        let (generated, _r2) = correlator.issue("x", None).unwrap();
        assert_eq!(generated, RequestId::Number(2));
    }

    #[test]
    fn duplicate_outstanding_id_is_rejected() {
        let correlator = Correlator::new();
        let (_, _r) = correlator.issue("x", Some("dup".into())).unwrap();
        let err = correlator.issue("x", Some("dup".into())).unwrap_err();
        assert!(matches!(err, McpError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn reply_resolves_exactly_once() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.issue("tools/list", None).unwrap();

        let first = correlator.complete(&id, Ok(json!({"tools": []})));
        assert!(matches!(first, Delivery::Delivered { ref method, .. } if method == "tools/list"));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"tools": []}));

        let second = correlator.complete(&id, Ok(json!({})));
        assert_eq!(second, Delivery::Late(CallState::Completed));
        assert_eq!(correlator.discarded(), 1);
        assert_eq!(correlator.state(&id), Some(CallState::Completed));
    }

    #[tokio::test]
    async fn error_reply_is_delivered_as_remote_error() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.issue("x", None).unwrap();
        correlator.complete(&id, Err(JsonRpcErrorData::invalid_params("nope")));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.remote_code(), Some(-32602));
        assert_eq!(correlator.state(&id), Some(CallState::Failed));
    }

    #[test]
    fn reply_after_timeout_is_discarded() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.issue("slow", None).unwrap();
        assert!(correlator.settle(
            &id,
            CallState::TimedOut,
            McpError::TimedOut {
                id: id.clone(),
                after: Duration::from_secs(2),
            }
        ));

        assert_eq!(
            correlator.complete(&id, Ok(json!({}))),
            Delivery::Late(CallState::TimedOut)
        );
        assert_eq!(correlator.discarded(), 1);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn unknown_reply_is_discarded() {
        let correlator = Correlator::new();
        assert_eq!(
            correlator.complete(&RequestId::Number(99), Ok(json!({}))),
            Delivery::Unknown
        );
        assert_eq!(correlator.discarded(), 1);
    }

    #[tokio::test]
    async fn cancel_wakes_the_caller() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.issue("x", None).unwrap();
        assert!(correlator.cancel(&id));
        assert!(!correlator.cancel(&id));
        assert!(matches!(
            rx.await.unwrap(),
            Err(McpError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn close_fails_everything_and_refuses_new_calls() {
        let correlator = Correlator::new();
        let (_, rx1) = correlator.issue("a", None).unwrap();
        let (_, rx2) = correlator.issue("b", None).unwrap();

        assert_eq!(correlator.close(), 2);
        assert!(matches!(rx1.await.unwrap(), Err(McpError::Closed)));
        assert!(matches!(rx2.await.unwrap(), Err(McpError::Closed)));
        assert!(matches!(
            correlator.issue("c", None),
            Err(McpError::Closed)
        ));
    }

    #[test]
    fn reusing_a_settled_id_starts_fresh() {
        let correlator = Correlator::new();
        let id = RequestId::from("same");
        let (_, _r1) = correlator.issue("x", Some(id.clone())).unwrap();
        correlator.complete(&id, Ok(json!(1)));

        let (_, _r2) = correlator.issue("x", Some(id.clone())).unwrap();
        assert_eq!(correlator.state(&id), Some(CallState::Sent));
    }

    #[test]
    fn settled_memory_is_bounded() {
        let correlator = Correlator::new();
        for _ in 0..(SETTLED_MEMORY + 10) {
            let (id, _rx) = correlator.issue("x", None).unwrap();
            correlator.complete(&id, Ok(json!(null)));
        }
        assert_eq!(correlator.state(&RequestId::Number(1)), None);
        assert_eq!(
            correlator.state(&RequestId::Number(SETTLED_MEMORY as i64 + 10)),
            Some(CallState::Completed)
        );
    }
}

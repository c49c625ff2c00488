//! Resumable server-to-client event log and the SSE wire decoder.
//!
//! Every outbound message on an HTTP session is appended to an
//! [`EventLog`] and given a per-session, strictly increasing event ID. A
//! reconnecting client presents the last ID it processed; everything after
//! it is replayed exactly once. Events at or below an acknowledged cursor
//! are pruned. When the buffer overflows, the oldest events are dropped and
//! any cursor that would need them is refused with [`CursorExpired`], so
//! loss is always reported and never silent.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// One buffered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: u64,
    pub data: String,
}

/// A resume cursor points at events that are no longer retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event cursor {cursor} is older than the retained history (pruned through {pruned_through})")]
pub struct CursorExpired {
    pub cursor: u64,
    pub pruned_through: u64,
}

#[derive(Debug)]
struct LogState {
    next_id: u64,
    events: VecDeque<StoredEvent>,
    pruned_through: u64,
    delivered: u64,
    lost: u64,
    closed: bool,
}

/// Bounded, acknowledged event buffer for one session.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    state: Mutex<LogState>,
    latest: watch::Sender<u64>,
}

impl EventLog {
    /// Creates a log that keeps at most `capacity` unacknowledged events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LogState {
                next_id: 1,
                events: VecDeque::new(),
                pruned_through: 0,
                delivered: 0,
                lost: 0,
                closed: false,
            }),
            latest,
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event and returns its ID.
    pub fn push(&self, data: String) -> u64 {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.events.push_back(StoredEvent { id, data });

        while state.events.len() > self.capacity {
            if let Some(dropped) = state.events.pop_front() {
                state.pruned_through = dropped.id;
                if dropped.id > state.delivered {
                    state.lost += 1;
                    warn!(
                        event_id = dropped.id,
                        "Event buffer full, dropping oldest undelivered event"
                    );
                } else {
                    debug!(event_id = dropped.id, "Evicting delivered event");
                }
            }
        }
        drop(state);

        self.latest.send_replace(id);
        id
    }

    /// Returns every retained event after `cursor`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`CursorExpired`] if events after `cursor` were already pruned.
    pub fn since(&self, cursor: u64) -> Result<Vec<StoredEvent>, CursorExpired> {
        let state = self.state();
        if cursor < state.pruned_through {
            return Err(CursorExpired {
                cursor,
                pruned_through: state.pruned_through,
            });
        }
        Ok(state
            .events
            .iter()
            .filter(|e| e.id > cursor)
            .cloned()
            .collect())
    }

    /// Drops every event at or below `cursor`; the client has processed them.
    pub fn acknowledge(&self, cursor: u64) {
        let mut state = self.state();
        let mut pruned = false;
        while state.events.front().is_some_and(|e| e.id <= cursor) {
            state.events.pop_front();
            pruned = true;
        }
        if pruned || cursor > state.pruned_through {
            state.pruned_through = state.pruned_through.max(cursor.min(state.next_id - 1));
        }
    }

    /// Records that events up to `id` were written to a live stream. They
    /// stay replayable until acknowledged, but evicting them is not a loss.
    pub fn mark_delivered(&self, id: u64) {
        let mut state = self.state();
        state.delivered = state.delivered.max(id);
    }

    /// Number of events evicted before any stream delivered them.
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.state().lost
    }

    /// Marks the log as finished; readers stop once they have drained it.
    pub fn close(&self) {
        self.state().closed = true;
        self.latest.send_modify(|_| {});
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ID of the most recent event, or 0.
    #[must_use]
    pub fn last_id(&self) -> u64 {
        *self.latest.borrow()
    }

    /// Wakes whenever an event is pushed or the log is closed.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.latest.subscribe()
    }
}

/// One decoded Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for the `text/event-stream` format.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes and returns the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };

            match field {
                "data" => self.data.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                "id" if !value.contains('\0') => self.id = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            id: self.id.clone(),
            event,
            data,
        })
    }
}

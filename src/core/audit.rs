//! Audit trail of scheduler decisions.
//!
//! The manager records one event per dispatch, deferral, merge, cancel and
//! generator lifecycle step when a sink is attached.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::history::HistoryId;
use crate::core::worker::WorkerId;
use crate::util::clock::now_ms;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Points dispatched to a simulator worker.
    Dispatch,
    /// Worker skipped for lack of resource units.
    Defer,
    /// Simulator results merged.
    Return,
    /// Points flagged `cancel_requested`.
    Cancel,
    /// Generator session started.
    GenStart,
    /// Completed group fed back to a generator.
    GenContinue,
    /// Generator session ended.
    GenStop,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dispatch => "dispatch",
            Self::Defer => "defer",
            Self::Return => "return",
            Self::Cancel => "cancel",
            Self::GenStart => "gen_start",
            Self::GenContinue => "gen_continue",
            Self::GenStop => "gen_stop",
        };
        f.write_str(name)
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Worker concerned.
    pub worker_id: WorkerId,
    /// Action taken.
    pub action: AuditAction,
    /// History ids concerned, ascending.
    pub history_ids: Vec<HistoryId>,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Bounded in-memory sink; the oldest events are dropped first.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Events with the given action, oldest first.
    pub fn of_action(&self, action: AuditAction) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter().filter(move |e| e.action == action)
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Helper to build an audit event stamped with a fresh id and the current time.
pub fn build_audit_event(
    worker_id: WorkerId,
    action: AuditAction,
    history_ids: &[HistoryId],
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        worker_id,
        action,
        history_ids: history_ids.to_vec(),
        created_at_ms: now_ms(),
        detail,
    }
}

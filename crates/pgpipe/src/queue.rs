//! Pending callback queue.
//!
//! One entry per request on the wire, in send order. The session returns
//! results in the same order, so the entry at the head of the queue always
//! belongs to the next result to arrive.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::PreparedStatement;
use crate::result::{FailureKind, ResultSet};

/// Completion action for one query.
pub type QueryCallback = Box<dyn FnOnce(ResultSet) + Send + 'static>;

/// Outcome of a prepare, shared by every execute pipelined behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareState {
    /// Sent, not yet acknowledged
    Pending,
    /// The server accepted the statement
    Ready,
    /// The server rejected the statement with this message
    Failed(String),
}

/// Handle on an in-flight prepare.
#[derive(Debug)]
pub struct PrepareTicket {
    state: Mutex<PrepareState>,
}

impl PrepareTicket {
    /// A ticket for a prepare that has just been sent.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PrepareState::Pending),
        })
    }

    /// Current state.
    pub fn state(&self) -> PrepareState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the prepare as accepted.
    pub fn succeed(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PrepareState::Ready;
    }

    /// Mark the prepare as rejected.
    pub fn fail(&self, message: impl Into<String>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) =
            PrepareState::Failed(message.into());
    }
}

/// A caller's execute request waiting for its result.
pub struct PendingExecute {
    pub sql: String,
    pub callback: QueryCallback,
    /// Set when the statement was prepared in the same pipeline
    pub ticket: Option<Arc<PrepareTicket>>,
}

impl PendingExecute {
    /// Deliver `result` to the callback.
    ///
    /// If the statement's prepare failed, the caller gets a prepare failure
    /// carrying the server's prepare message instead of the secondary
    /// "prepared statement does not exist" error.
    pub fn complete(self, result: ResultSet) {
        let result = match self.ticket.map(|t| t.state()) {
            Some(PrepareState::Failed(message)) => ResultSet::failed(FailureKind::Prepare, message),
            _ => result,
        };
        (self.callback)(result);
    }
}

/// What to do with the next arriving result.
pub enum PendingCallback {
    /// Acknowledgment of a prepare request
    Prepare {
        statement: PreparedStatement,
        ticket: Arc<PrepareTicket>,
    },
    /// Rows (or error) for a caller's execute request
    Execute(PendingExecute),
}

impl PendingCallback {
    /// Resolve the entry without a server result.
    ///
    /// Execute callbacks receive a failed result of `kind`; prepare tickets
    /// are marked failed so nothing waits on them.
    pub fn abandon(self, kind: FailureKind, message: &str) {
        match self {
            PendingCallback::Execute(execute) => {
                (execute.callback)(ResultSet::failed(kind, message));
            }
            PendingCallback::Prepare { ticket, .. } => ticket.fail(message),
        }
    }

    /// SQL text of the request.
    pub fn sql(&self) -> &str {
        match self {
            PendingCallback::Prepare { statement, .. } => &statement.sql,
            PendingCallback::Execute(execute) => &execute.sql,
        }
    }

    /// Whether this is a prepare entry.
    pub fn is_prepare(&self) -> bool {
        matches!(self, PendingCallback::Prepare { .. })
    }
}

impl fmt::Debug for PendingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingCallback::Prepare { statement, ticket } => f
                .debug_struct("Prepare")
                .field("statement", statement)
                .field("state", &ticket.state())
                .finish(),
            PendingCallback::Execute(execute) => f
                .debug_struct("Execute")
                .field("sql", &execute.sql)
                .field("pipelined", &execute.ticket.is_some())
                .finish_non_exhaustive(),
        }
    }
}

/// Thread-safe FIFO of pending callbacks.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<VecDeque<PendingCallback>>,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the tail.
    pub fn push(&self, entry: PendingCallback) {
        self.lock().push_back(entry);
    }

    /// Remove and return the head entry.
    pub fn pop(&self) -> Option<PendingCallback> {
        self.lock().pop_front()
    }

    /// Remove every entry, in order.
    pub fn take_all(&self) -> Vec<PendingCallback> {
        self.lock().drain(..).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingCallback>> {
        // Entries stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

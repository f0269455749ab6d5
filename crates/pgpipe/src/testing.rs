//! In-memory session for tests.
//!
//! [`ScriptedSession`] records every request it is asked to send and hands
//! back results supplied by the test, either pushed explicitly or produced
//! by a responder closure as each request is sent. Results only become
//! visible to the engine after `consume_input`, the way bytes only reach a
//! real client once the socket is read.
//!
//! ```ignore
//! let session = ScriptedSession::new().with_responder(|req| match req {
//!     SentRequest::Prepare { .. } => TextResult::command(),
//!     SentRequest::Execute { .. } => TextResult::new([("n", oid::INT4)]).row([Some("1".into())]),
//! });
//! let script = session.handle();
//! let pipeline = PgPipeline::with_session(session, &PgConfig::default());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pgpipe_core::error::{ConnectionErrorKind, QueryError, QueryErrorKind};
use pgpipe_core::{Error, Result};

use crate::result::{RawResult, TextResult};
use crate::session::Session;
use crate::types::Param;

/// A request the engine sent through the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentRequest {
    /// Prepare `sql` under `name`
    Prepare {
        name: String,
        sql: String,
        param_count: usize,
    },
    /// Execute the statement `name`
    Execute { name: String, params: Vec<Param> },
}

impl SentRequest {
    /// Statement handle the request refers to.
    pub fn name(&self) -> &str {
        match self {
            SentRequest::Prepare { name, .. } | SentRequest::Execute { name, .. } => name,
        }
    }

    /// Whether this is a prepare request.
    pub fn is_prepare(&self) -> bool {
        matches!(self, SentRequest::Prepare { .. })
    }
}

type Responder = Box<dyn FnMut(&SentRequest) -> TextResult + Send>;

#[derive(Default)]
struct ScriptState {
    sent: Vec<SentRequest>,
    /// Results "on the wire", not yet read
    incoming: VecDeque<TextResult>,
    /// Results read and ready for `next_result`
    ready: VecDeque<TextResult>,
    /// Results whose request is still only partly written
    unsent: VecDeque<TextResult>,
    /// Flushes needed before the buffered output is fully written
    stalled_flushes: usize,
    busy: bool,
    fail_next_send: Option<String>,
    break_next_send: Option<String>,
    fail_pump: Option<String>,
    responder: Option<Responder>,
    dropped: bool,
}

/// Scripted [`Session`] implementation.
pub struct ScriptedSession {
    socket: i32,
    state: Arc<Mutex<ScriptState>>,
}

/// Test-side view of a [`ScriptedSession`] that has been moved into a
/// pipeline.
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSession {
    /// A session on a fake socket with nothing scripted.
    pub fn new() -> Self {
        Self {
            socket: 7,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Use a different fake socket number.
    #[must_use]
    pub fn with_socket(mut self, socket: i32) -> Self {
        self.socket = socket;
        self
    }

    /// Produce a result for every request as it is sent.
    #[must_use]
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&SentRequest) -> TextResult + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(responder));
        self
    }

    /// Handle for inspecting and steering the session after it is moved.
    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn record(&mut self, request: SentRequest) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_next_send.take() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Execute,
                sql: None,
                message,
            }));
        }
        if let Some(responder) = state.responder.as_mut() {
            let result = responder(&request);
            if state.stalled_flushes > 0 {
                state.unsent.push_back(result);
            } else {
                state.incoming.push_back(result);
            }
        }
        state.sent.push(request);
        // The request is buffered, but the connection failed pushing it out
        if let Some(message) = state.break_next_send.take() {
            return Err(Error::connection(ConnectionErrorKind::Disconnected, message));
        }
        Ok(())
    }
}

impl Default for ScriptedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        lock(&self.state).dropped = true;
    }
}

impl Session for ScriptedSession {
    fn socket(&self) -> Option<i32> {
        Some(self.socket)
    }

    fn send_prepare(&mut self, name: &str, sql: &str, param_count: usize) -> Result<()> {
        self.record(SentRequest::Prepare {
            name: name.to_string(),
            sql: sql.to_string(),
            param_count,
        })
    }

    fn send_query_prepared(&mut self, name: &str, params: &[Param]) -> Result<()> {
        self.record(SentRequest::Execute {
            name: name.to_string(),
            params: params.to_vec(),
        })
    }

    fn wants_write(&self) -> bool {
        lock(&self.state).stalled_flushes > 0
    }

    fn flush(&mut self) -> Result<bool> {
        let mut state = lock(&self.state);
        state.stalled_flushes = state.stalled_flushes.saturating_sub(1);
        if state.stalled_flushes > 0 {
            return Ok(false);
        }
        let written: Vec<TextResult> = state.unsent.drain(..).collect();
        state.incoming.extend(written);
        Ok(true)
    }

    fn consume_input(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_pump.clone() {
            return Err(Error::connection(ConnectionErrorKind::Disconnected, message));
        }
        let arrived: Vec<TextResult> = state.incoming.drain(..).collect();
        state.ready.extend(arrived);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    fn next_result(&mut self) -> Option<Box<dyn RawResult>> {
        let result = lock(&self.state).ready.pop_front()?;
        Some(Box::new(result))
    }

    fn error_message(&self) -> String {
        let state = lock(&self.state);
        state.fail_pump.clone().unwrap_or_default()
    }
}

impl ScriptHandle {
    /// Every request sent so far, in order.
    pub fn sent(&self) -> Vec<SentRequest> {
        lock(&self.state).sent.clone()
    }

    /// Number of prepare requests sent so far.
    pub fn prepare_count(&self) -> usize {
        lock(&self.state)
            .sent
            .iter()
            .filter(|r| r.is_prepare())
            .count()
    }

    /// Put a result on the wire; it is readable after the next pump.
    pub fn push_result(&self, result: TextResult) {
        lock(&self.state).incoming.push_back(result);
    }

    /// Make `is_busy` report `busy`.
    pub fn set_busy(&self, busy: bool) {
        lock(&self.state).busy = busy;
    }

    /// Fail the next send with `message`.
    pub fn fail_next_send(&self, message: impl Into<String>) {
        lock(&self.state).fail_next_send = Some(message.into());
    }

    /// Accept the next send into the output buffer, then report the
    /// connection lost with `message`.
    pub fn break_next_send(&self, message: impl Into<String>) {
        lock(&self.state).break_next_send = Some(message.into());
    }

    /// Leave output only partly written until `flushes` more flushes.
    /// Responses to requests sent meanwhile arrive once it is all written.
    pub fn stall_writes(&self, flushes: usize) {
        lock(&self.state).stalled_flushes = flushes;
    }

    /// Fail every subsequent read with `message`.
    pub fn fail_pump(&self, message: impl Into<String>) {
        lock(&self.state).fail_pump = Some(message.into());
    }

    /// Results on the wire or read but not yet taken.
    pub fn undelivered(&self) -> usize {
        let state = lock(&self.state);
        state.incoming.len() + state.ready.len()
    }

    /// Whether the session has been dropped by its owner.
    pub fn is_dropped(&self) -> bool {
        lock(&self.state).dropped
    }
}

impl std::fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ScriptHandle")
            .field("sent", &state.sent.len())
            .field("incoming", &state.incoming.len())
            .field("ready", &state.ready.len())
            .field("busy", &state.busy)
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Pipelined query engine.
//!
//! [`PgPipeline`] owns one non-blocking session and lets any number of
//! threads submit queries without waiting for earlier ones to finish.
//! Requests are written to the wire immediately; results are collected when
//! the host reports the socket readable and are matched to their callbacks
//! strictly in send order.
//!
//! Each distinct SQL text is prepared once per connection. The first
//! submission sends the prepare and the execute back to back; later ones
//! reuse the cached handle, or pipeline behind the prepare if it has not
//! been acknowledged yet.
//!
//! Locks: the wire lock (session, handle names, in-flight prepares) is
//! taken before the queue lock; the statement cache lock is a leaf. No lock
//! is held while a callback runs.
//!
//! Pending callbacks live inside the connection. A callback that keeps a
//! strong [`PgPipeline`] keeps the connection open until
//! [`close`](PgPipeline::close); chain follow-up queries through a
//! [`WeakPipeline`] instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use pgpipe_core::error::{ConnectionErrorKind, DesyncError};
use pgpipe_core::{Error, Result};

use crate::cache::{NameGenerator, PreparedStatement, StatementCache};
use crate::config::PgConfig;
use crate::queue::{PendingCallback, PendingExecute, PendingQueue, PrepareTicket, QueryCallback};
use crate::reactor::{Reactor, Readiness};
use crate::result::{FailureKind, RawResult, ResultSet};
use crate::session::Session;
use crate::types::{Param, ToParam};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting requests
    Open,
    /// Reading from the socket failed; the connection must be rebuilt
    Broken,
    /// Closed locally
    Closed,
}

/// What a call to [`PgPipeline::on_readable`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Dispatched this many results
    Dispatched(usize),
    /// The next result is still incomplete; nothing was dispatched
    Busy,
    /// Another drain is running on a different thread
    InProgress,
    /// The connection is no longer open
    Closed,
}

struct Wire<S> {
    session: Option<S>,
    names: NameGenerator,
    /// Prepares sent but not yet acknowledged, by SQL text
    in_flight: HashMap<String, (String, Arc<PrepareTicket>)>,
    state: ConnectionState,
    last_error: Option<String>,
    /// Host loop asked for write readiness while output is pending
    reactor: Option<Box<dyn Reactor + Send + Sync>>,
    write_armed: bool,
}

struct Shared<S: Session> {
    wire: Mutex<Wire<S>>,
    cache: Mutex<StatementCache>,
    queue: PendingQueue,
    draining: AtomicBool,
}

/// Pipelined PostgreSQL connection.
///
/// Cloning is cheap and every clone drives the same connection. The
/// connection is torn down by [`close`](PgPipeline::close) or when the last
/// clone is dropped; requests still waiting for results then receive a
/// connection failure. Clones captured by pending callbacks count too, so
/// callbacks should hold a [`WeakPipeline`].
pub struct PgPipeline<S: Session> {
    shared: Arc<Shared<S>>,
}

/// Non-owning handle to a [`PgPipeline`].
///
/// Does not keep the connection open, so it is safe to capture in a query
/// callback:
///
/// ```ignore
/// let weak = pipeline.downgrade();
/// pipeline.query("SELECT id FROM users LIMIT 1", params!(), move |rs| {
///     let Some(pipeline) = weak.upgrade() else { return };
///     let id = rs.first().and_then(|r| r.get_as::<i64, _>("id").ok());
///     pipeline.query("SELECT * FROM orders WHERE user_id = $1", [id], |_| {});
/// });
/// ```
pub struct WeakPipeline<S: Session> {
    shared: Weak<Shared<S>>,
}

impl<S: Session> WeakPipeline<S> {
    /// The pipeline, unless every strong handle is gone.
    pub fn upgrade(&self) -> Option<PgPipeline<S>> {
        self.shared.upgrade().map(|shared| PgPipeline { shared })
    }
}

impl<S: Session> Clone for WeakPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<S: Session> std::fmt::Debug for WeakPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakPipeline")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl<S: Session> Clone for PgPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Session> std::fmt::Debug for PgPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPipeline")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("cached_statements", &self.cached_statements())
            .finish()
    }
}

impl<S: Session + 'static> PgPipeline<S> {
    /// Wrap an established session.
    pub fn with_session(session: S, config: &PgConfig) -> Self {
        Self::with_names(session, NameGenerator::new(config.statement_name_len))
    }

    /// Wrap an established session, drawing handle names from `names`.
    pub fn with_names(session: S, names: NameGenerator) -> Self {
        Self {
            shared: Arc::new(Shared {
                wire: Mutex::new(Wire {
                    session: Some(session),
                    names,
                    in_flight: HashMap::new(),
                    state: ConnectionState::Open,
                    last_error: None,
                    reactor: None,
                    write_armed: false,
                }),
                cache: Mutex::new(StatementCache::new()),
                queue: PendingQueue::new(),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Submit `sql` with text-encoded `params`.
    ///
    /// `callback` runs exactly once: from a later [`on_readable`] call with
    /// the query's result, or synchronously here if the request cannot be
    /// sent.
    ///
    /// [`on_readable`]: PgPipeline::on_readable
    pub fn submit<F>(&self, sql: impl Into<String>, params: Vec<Param>, callback: F)
    where
        F: FnOnce(ResultSet) + Send + 'static,
    {
        self.shared.submit(sql.into(), params, Box::new(callback));
    }

    /// Submit `sql` with native parameter values.
    ///
    /// ```ignore
    /// pipeline.query(
    ///     "SELECT * FROM users WHERE id = $1",
    ///     params!(565197576026980365i64),
    ///     |rs| println!("{} rows", rs.len()),
    /// );
    /// ```
    pub fn query<I, P, F>(&self, sql: impl Into<String>, params: I, callback: F)
    where
        I: IntoIterator<Item = P>,
        P: ToParam,
        F: FnOnce(ResultSet) + Send + 'static,
    {
        let params = params.into_iter().map(|p| p.to_param()).collect();
        self.submit(sql, params, callback);
    }

    /// Collect and dispatch every result the socket has delivered.
    ///
    /// Call when the host reports the socket readable. Errors are fatal for
    /// the read source: the host should stop watching the socket.
    pub fn on_readable(&self) -> Result<Drain> {
        self.shared.on_readable()
    }

    /// Flush output left over from an earlier send.
    ///
    /// Call when the host reports the socket writable. Returns `true` once
    /// nothing is left to write. Hosts that use [`start`](PgPipeline::start)
    /// never need to call this themselves.
    pub fn on_writable(&self) -> Result<bool> {
        self.shared.on_writable()
    }

    /// Register [`on_readable`](PgPipeline::on_readable) with the host's
    /// event loop. The reactor is kept so the pipeline can ask for write
    /// readiness whenever a request is only partly written.
    ///
    /// The registration does not keep the connection alive; once every
    /// handle is dropped the handler asks to be deregistered.
    pub fn start<R>(&self, reactor: &R) -> Result<()>
    where
        R: Reactor + Clone + Send + Sync + 'static,
    {
        let socket = self.socket().ok_or_else(|| {
            Error::connection(ConnectionErrorKind::Closed, "connection has no socket")
        })?;

        let shared = Arc::downgrade(&self.shared);
        reactor.register_readable(
            socket,
            Box::new(move || {
                let Some(shared) = shared.upgrade() else {
                    return Readiness::Deregister;
                };
                match shared.on_readable() {
                    Ok(Drain::Closed) => Readiness::Deregister,
                    Ok(_) | Err(Error::QueueDesync(_)) => Readiness::Continue,
                    Err(_) => Readiness::Deregister,
                }
            }),
        )?;

        let mut wire = self.shared.wire();
        wire.reactor = Some(Box::new(reactor.clone()));
        self.shared.arm_write(&mut wire);
        drop(wire);

        tracing::debug!(socket, "Registered connection with reactor");
        Ok(())
    }

    /// Close the connection, failing every request still waiting for a
    /// result.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// A handle that does not keep the connection open.
    pub fn downgrade(&self) -> WeakPipeline<S> {
        WeakPipeline {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<S: Session> PgPipeline<S> {
    /// Socket the host should watch, while the connection is open.
    pub fn socket(&self) -> Option<i32> {
        let wire = self.shared.wire();
        match wire.state {
            ConnectionState::Open => wire.session.as_ref().and_then(Session::socket),
            _ => None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.wire().state
    }

    /// Message of the failure that broke the connection, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.wire().last_error.clone()
    }

    /// Whether a request is still partly unwritten.
    pub fn wants_write(&self) -> bool {
        let wire = self.shared.wire();
        wire.session.as_ref().is_some_and(Session::wants_write)
    }

    /// Number of requests waiting for a result, prepares included.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of statements prepared and acknowledged.
    pub fn cached_statements(&self) -> usize {
        self.shared.cache().len()
    }

    /// Whether `sql` has been prepared and acknowledged.
    pub fn is_prepared(&self, sql: &str) -> bool {
        self.shared.cache().contains(sql)
    }
}

impl<S: Session> Shared<S> {
    fn wire(&self) -> MutexGuard<'_, Wire<S>> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, StatementCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a request the session refused.
    ///
    /// A connection error means the request may already be buffered, so its
    /// result could still arrive without a queue slot; the connection is
    /// broken instead of risking results reaching the wrong callbacks.
    fn send_failed(
        &self,
        guard: MutexGuard<'_, Wire<S>>,
        sql: &str,
        error: &Error,
        callback: QueryCallback,
    ) {
        let message = error.to_string();
        if error.is_connection_error() {
            let failed = self.break_connection(guard, &message);
            tracing::error!(
                sql = %sql,
                error = %message,
                pending = failed,
                "Lost connection while sending"
            );
            callback(ResultSet::failed(FailureKind::Connection, message));
        } else {
            drop(guard);
            tracing::warn!(sql = %sql, error = %message, "Failed to send request");
            callback(ResultSet::failed(FailureKind::Execute, message));
        }
    }

    fn on_writable(&self) -> Result<bool> {
        let mut guard = self.wire();
        let wire = &mut *guard;
        let state = wire.state;
        let session = match wire.session.as_mut() {
            Some(session) if state == ConnectionState::Open => session,
            _ => {
                wire.write_armed = false;
                return Ok(true);
            }
        };

        match session.flush() {
            Ok(done) => {
                if done {
                    wire.write_armed = false;
                    tracing::trace!("Flushed pending output");
                }
                Ok(done)
            }
            Err(e) => {
                let message = e.to_string();
                let failed = self.break_connection(guard, &message);
                tracing::error!(error = %message, pending = failed, "Lost connection while flushing");
                Err(Error::connection(ConnectionErrorKind::Disconnected, message))
            }
        }
    }

    fn on_readable(&self) -> Result<Drain> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(Drain::InProgress);
        }
        let _drain = DrainGuard(&self.draining);

        if !self.pump()? {
            return Ok(Drain::Closed);
        }
        self.drain()
    }

    /// Dispatch every complete result the session holds.
    fn drain(&self) -> Result<Drain> {
        let mut dispatched = 0usize;
        let mut busy = false;
        let mut closed = false;
        loop {
            let (entry, raw) = {
                let mut wire = self.wire();
                if wire.state != ConnectionState::Open {
                    closed = true;
                    break;
                }
                let Some(session) = wire.session.as_mut() else {
                    closed = true;
                    break;
                };
                if session.is_busy() {
                    busy = true;
                    break;
                }
                let Some(raw) = session.next_result() else {
                    break;
                };
                // Popped under the wire lock so teardown cannot take the
                // entry after its result has been read
                let Some(entry) = self.queue.pop() else {
                    drop(wire);
                    tracing::error!(
                        results = dispatched,
                        "Result arrived with no pending request; dropping it"
                    );
                    return Err(Error::QueueDesync(DesyncError { unmatched: 1 }));
                };
                (entry, raw)
            };

            self.resolve(entry, raw);
            dispatched += 1;
        }

        if closed {
            tracing::trace!(results = dispatched, "Connection closed during drain");
            return Ok(Drain::Closed);
        }
        if busy && dispatched == 0 {
            tracing::trace!(pending = self.queue.len(), "Result incomplete; waiting for more input");
            return Ok(Drain::Busy);
        }

        tracing::trace!(results = dispatched, pending = self.queue.len(), "Drained results");
        Ok(Drain::Dispatched(dispatched))
    }

    /// Move socket bytes into the session.
    ///
    /// Returns `false` if the connection is no longer open. A read failure
    /// breaks the connection and fails every pending request.
    fn pump(&self) -> Result<bool> {
        let mut guard = self.wire();
        let wire = &mut *guard;
        let state = wire.state;
        let session = match wire.session.as_mut() {
            Some(session) if state == ConnectionState::Open => session,
            _ => return Ok(false),
        };

        let Err(e) = session.consume_input() else {
            return Ok(true);
        };

        let message = e.to_string();
        let failed = self.break_connection(guard, &message);
        tracing::error!(error = %message, pending = failed, "Lost connection to PostgreSQL");
        Err(Error::connection(ConnectionErrorKind::Disconnected, message))
    }

    /// Mark the connection broken and fail every pending request. Returns
    /// the number of entries failed.
    fn break_connection(&self, mut guard: MutexGuard<'_, Wire<S>>, message: &str) -> usize {
        guard.state = ConnectionState::Broken;
        guard.last_error = Some(message.to_string());
        guard.in_flight.clear();
        guard.write_armed = false;
        drop(guard);

        self.fail_pending(FailureKind::Connection, message)
    }

    fn resolve(&self, entry: PendingCallback, raw: Box<dyn RawResult>) {
        match entry {
            PendingCallback::Prepare { statement, ticket } => {
                self.finish_prepare(statement, &ticket, raw.error_message());
            }
            PendingCallback::Execute(execute) => execute.complete(ResultSet::from_raw(raw)),
        }
    }

    fn finish_prepare(
        &self,
        statement: PreparedStatement,
        ticket: &Arc<PrepareTicket>,
        error: Option<&str>,
    ) {
        let mut wire = self.wire();
        let current = wire
            .in_flight
            .get(&statement.sql)
            .is_some_and(|(_, t)| Arc::ptr_eq(t, ticket));
        if current {
            wire.in_flight.remove(&statement.sql);
        }

        match error {
            None => {
                tracing::debug!(sql = %statement.sql, statement = %statement.name, "Prepared statement");
                ticket.succeed();
                // Cached before the wire lock is released so no submission
                // sees the statement as neither in flight nor cached
                self.cache().insert(statement);
            }
            Some(message) => {
                tracing::warn!(
                    sql = %statement.sql,
                    statement = %statement.name,
                    error = %message,
                    "Prepare failed"
                );
                ticket.fail(message);
            }
        }
    }

    /// Resolve every queued entry with `kind`.
    fn fail_pending(&self, kind: FailureKind, message: &str) -> usize {
        let entries = self.queue.take_all();
        let count = entries.len();
        for entry in entries {
            entry.abandon(kind, message);
        }
        count
    }

    fn shutdown(&self) {
        let session = {
            let mut wire = self.wire();
            if wire.state == ConnectionState::Closed {
                return;
            }
            wire.state = ConnectionState::Closed;
            wire.in_flight.clear();
            wire.reactor = None;
            wire.write_armed = false;
            wire.session.take()
        };
        drop(session);

        let failed = self.fail_pending(FailureKind::Connection, "connection closed");
        tracing::debug!(pending = failed, "Connection closed");
    }
}

impl<S: Session + 'static> Shared<S> {
    fn submit(self: &Arc<Self>, sql: String, params: Vec<Param>, callback: QueryCallback) {
        let mut guard = self.wire();
        let wire = &mut *guard;

        let state = wire.state;
        let session = match wire.session.as_mut() {
            Some(session) if state == ConnectionState::Open => session,
            _ => {
                drop(guard);
                tracing::debug!(sql = %sql, ?state, "Rejecting query on unusable connection");
                callback(ResultSet::failed(
                    FailureKind::Connection,
                    format!("connection is {}", state_name(state)),
                ));
                return;
            }
        };

        let cached = self.cache().lookup(&sql);
        let (name, ticket) = if let Some(statement) = cached {
            (statement.name, None)
        } else if let Some((name, ticket)) = wire.in_flight.get(&sql) {
            tracing::trace!(sql = %sql, statement = %name, "Pipelining behind in-flight prepare");
            (name.clone(), Some(Arc::clone(ticket)))
        } else {
            let name = wire.names.next_name();
            if let Err(e) = session.send_prepare(&name, &sql, params.len()) {
                self.send_failed(guard, &sql, &e, callback);
                return;
            }
            tracing::debug!(sql = %sql, statement = %name, "Sent prepare");

            let ticket = PrepareTicket::new();
            wire.in_flight
                .insert(sql.clone(), (name.clone(), Arc::clone(&ticket)));
            self.queue.push(PendingCallback::Prepare {
                statement: PreparedStatement {
                    sql: sql.clone(),
                    name: name.clone(),
                    param_count: params.len(),
                },
                ticket: Arc::clone(&ticket),
            });
            (name, Some(ticket))
        };

        if let Err(e) = session.send_query_prepared(&name, &params) {
            self.send_failed(guard, &sql, &e, callback);
            return;
        }

        tracing::trace!(sql = %sql, statement = %name, "Sent execute");
        self.queue.push(PendingCallback::Execute(PendingExecute {
            sql,
            callback,
            ticket,
        }));
        self.arm_write(wire);
    }

    /// Ask the reactor for write readiness if output is pending.
    fn arm_write(self: &Arc<Self>, wire: &mut Wire<S>) {
        if wire.write_armed || wire.state != ConnectionState::Open {
            return;
        }
        let Some(session) = wire.session.as_ref() else {
            return;
        };
        if !session.wants_write() {
            return;
        }
        let (Some(reactor), Some(socket)) = (wire.reactor.as_ref(), session.socket()) else {
            tracing::trace!("Output pending; waiting for the host to call on_writable");
            return;
        };

        let shared = Arc::downgrade(self);
        let handler = Box::new(move || {
            let Some(shared) = shared.upgrade() else {
                return Readiness::Deregister;
            };
            match shared.on_writable() {
                Ok(false) => Readiness::Continue,
                Ok(true) | Err(_) => Readiness::Deregister,
            }
        });
        match reactor.register_writable(socket, handler) {
            Ok(()) => {
                wire.write_armed = true;
                tracing::trace!(socket, "Waiting for write readiness");
            }
            Err(e) => tracing::warn!(socket, error = %e, "Failed to watch for write readiness"),
        }
    }
}

impl<S: Session> Drop for Shared<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the draining flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn state_name(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Open => "open",
        ConnectionState::Broken => "broken",
        ConnectionState::Closed => "closed",
    }
}

//! Host event-loop boundary.
//!
//! The pipeline does not run its own loop. The host owns an event loop that
//! watches file descriptors; the pipeline registers its socket there and is
//! called back whenever the socket becomes readable, and while a request is
//! only partly written, whenever it becomes writable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pgpipe_core::Result;

/// What the host should do with an event source after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Keep watching the socket
    Continue,
    /// Stop watching the socket for this event
    Deregister,
}

/// Handler invoked when a registered socket is ready.
pub type ReadHandler = Box<dyn FnMut() -> Readiness + Send + 'static>;

/// A host event loop that can watch sockets.
pub trait Reactor {
    /// Call `handler` each time `socket` becomes readable, until it returns
    /// [`Readiness::Deregister`].
    fn register_readable(&self, socket: i32, handler: ReadHandler) -> Result<()>;

    /// Call `handler` each time `socket` becomes writable, until it returns
    /// [`Readiness::Deregister`]. The pipeline registers only while output
    /// is pending, so level-triggered loops do not spin.
    fn register_writable(&self, socket: i32, handler: ReadHandler) -> Result<()>;
}

type Handlers = Mutex<HashMap<i32, ReadHandler>>;

/// Reactor for hosts that poll readiness themselves.
///
/// Handlers are stored by socket and run when the host calls
/// [`notify`](ManualReactor::notify) or
/// [`notify_writable`](ManualReactor::notify_writable). Clones share the
/// same registrations.
#[derive(Clone, Default)]
pub struct ManualReactor {
    readable: Arc<Handlers>,
    writable: Arc<Handlers>,
}

impl ManualReactor {
    /// Create a reactor with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that `socket` is readable. Returns `false` if nothing is
    /// registered for it.
    pub fn notify(&self, socket: i32) -> bool {
        fire(&self.readable, socket)
    }

    /// Report that `socket` is writable. Returns `false` if nothing is
    /// registered for it.
    pub fn notify_writable(&self, socket: i32) -> bool {
        fire(&self.writable, socket)
    }

    /// Whether a read handler is registered for `socket`.
    pub fn is_registered(&self, socket: i32) -> bool {
        lock(&self.readable).contains_key(&socket)
    }

    /// Whether a write handler is registered for `socket`.
    pub fn is_write_registered(&self, socket: i32) -> bool {
        lock(&self.writable).contains_key(&socket)
    }
}

impl Reactor for ManualReactor {
    fn register_readable(&self, socket: i32, handler: ReadHandler) -> Result<()> {
        if lock(&self.readable).insert(socket, handler).is_some() {
            tracing::warn!(socket, "Replaced existing read handler");
        }
        Ok(())
    }

    fn register_writable(&self, socket: i32, handler: ReadHandler) -> Result<()> {
        if lock(&self.writable).insert(socket, handler).is_some() {
            tracing::warn!(socket, "Replaced existing write handler");
        }
        Ok(())
    }
}

impl std::fmt::Debug for ManualReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let readable: Vec<i32> = lock(&self.readable).keys().copied().collect();
        let writable: Vec<i32> = lock(&self.writable).keys().copied().collect();
        f.debug_struct("ManualReactor")
            .field("readable", &readable)
            .field("writable", &writable)
            .finish()
    }
}

fn fire(handlers: &Handlers, socket: i32) -> bool {
    // Run the handler outside the lock so it may register other sockets
    let Some(mut handler) = lock(handlers).remove(&socket) else {
        return false;
    };
    match handler() {
        Readiness::Continue => {
            lock(handlers).entry(socket).or_insert(handler);
        }
        Readiness::Deregister => {
            tracing::debug!(socket, "Handler deregistered");
        }
    }
    true
}

fn lock(handlers: &Handlers) -> MutexGuard<'_, HashMap<i32, ReadHandler>> {
    handlers.lock().unwrap_or_else(PoisonError::into_inner)
}

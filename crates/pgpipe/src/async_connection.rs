//! Awaitable queries.
//!
//! [`PgPipeline::query_async`] submits immediately, exactly like
//! [`PgPipeline::query`], and returns a [`QueryFuture`] that completes when
//! the host's readiness loop delivers the result. Awaiting does not drive
//! the connection; something must still call `on_readable`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use asupersync::{Cx, Outcome};

use pgpipe_core::Error;

use crate::connection::PgPipeline;
use crate::result::ResultSet;
use crate::session::Session;
use crate::types::ToParam;

#[derive(Default)]
struct Slot {
    result: Option<ResultSet>,
    waker: Option<Waker>,
}

/// Future for one submitted query.
///
/// Resolves to the result set, to the error the result set carries, or to
/// `Cancelled` if the context is cancelled first. Cancelling does not
/// withdraw the request; its result is discarded when it arrives.
#[must_use = "the query is already submitted; dropping the future discards its result"]
pub struct QueryFuture<'cx> {
    cx: &'cx Cx,
    slot: Arc<Mutex<Slot>>,
}

impl<'cx> QueryFuture<'cx> {
    fn new(cx: &'cx Cx) -> Self {
        Self {
            cx,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    fn completer(&self) -> impl FnOnce(ResultSet) + Send + 'static {
        let slot = Arc::clone(&self.slot);
        move |rs| {
            let waker = {
                let mut slot = lock(&slot);
                slot.result = Some(rs);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Whether the result has arrived.
    pub fn is_ready(&self) -> bool {
        lock(&self.slot).result.is_some()
    }
}

impl Future for QueryFuture<'_> {
    type Output = Outcome<ResultSet, Error>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = lock(&self.slot);
        if let Some(rs) = slot.result.take() {
            return Poll::Ready(match rs.check().err() {
                None => Outcome::Ok(rs),
                Some(e) => Outcome::Err(e),
            });
        }

        if let Some(reason) = self.cx.cancel_reason() {
            return Poll::Ready(Outcome::Cancelled(reason));
        }

        match &slot.waker {
            Some(waker) if waker.will_wake(task.waker()) => {}
            _ => slot.waker = Some(task.waker().clone()),
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for QueryFuture<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFuture")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl<S: Session + 'static> PgPipeline<S> {
    /// Submit `sql` and return a future for its result.
    ///
    /// ```ignore
    /// let rs = match pipeline.query_async(&cx, "SELECT name FROM users WHERE id = $1", [7i64]).await {
    ///     Outcome::Ok(rs) => rs,
    ///     Outcome::Err(e) => return Outcome::Err(e),
    ///     Outcome::Cancelled(r) => return Outcome::Cancelled(r),
    ///     Outcome::Panicked(p) => return Outcome::Panicked(p),
    /// };
    /// ```
    pub fn query_async<'cx, I, P>(
        &self,
        cx: &'cx Cx,
        sql: impl Into<String>,
        params: I,
    ) -> QueryFuture<'cx>
    where
        I: IntoIterator<Item = P>,
        P: ToParam,
    {
        let future = QueryFuture::new(cx);
        self.query(sql, params, future.completer());
        future
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

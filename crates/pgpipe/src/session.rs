//! Client session abstraction.
//!
//! The engine never talks to the socket itself. A [`Session`] owns the
//! non-blocking client connection and exposes the handful of asynchronous
//! primitives the pipeline needs: send a prepare, send an execute, pull
//! bytes off the socket, and hand back completed results one at a time.

use pgpipe_core::Result;

use crate::result::RawResult;
use crate::types::Param;

/// A non-blocking client connection that accepts pipelined requests.
///
/// Every successful `send_*` call produces exactly one result from
/// [`next_result`](Session::next_result), in send order.
///
/// A `send_*` error that is a connection error means the request may
/// already be buffered for the wire; the session is unusable afterwards.
/// Any other error means nothing was queued.
pub trait Session: Send {
    /// File descriptor to watch for readability, if connected.
    fn socket(&self) -> Option<i32>;

    /// Send a request to prepare `sql` under the handle `name`.
    fn send_prepare(&mut self, name: &str, sql: &str, param_count: usize) -> Result<()>;

    /// Send a request to execute the prepared statement `name`.
    fn send_query_prepared(&mut self, name: &str, params: &[Param]) -> Result<()>;

    /// Whether part of an earlier request is still waiting to be written.
    fn wants_write(&self) -> bool {
        false
    }

    /// Write as much buffered output as the socket accepts. Returns `true`
    /// once nothing is left.
    fn flush(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Read whatever the socket has into the input buffer.
    fn consume_input(&mut self) -> Result<()>;

    /// Whether the next result is still incomplete.
    fn is_busy(&self) -> bool;

    /// Take the next complete result, or `None` if none is ready.
    fn next_result(&mut self) -> Option<Box<dyn RawResult>>;

    /// Most recent error text reported by the client library.
    fn error_message(&self) -> String;
}

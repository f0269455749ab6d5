//! [`Session`] backed by libpq in pipeline mode.
//!
//! Every request is followed by a sync point, so a failed prepare aborts
//! only its own segment of the pipeline and the execute behind it still
//! produces exactly one (failed) result.

use std::ffi::{CString, c_char, c_int};
use std::ptr;

use pgpipe_core::error::{ConnectionErrorKind, QueryError, QueryErrorKind};
use pgpipe_core::{Error, Result};

use crate::config::PgConfig;
use crate::connection::PgPipeline;
use crate::ffi;
use crate::result::RawResult;
use crate::session::Session;
use crate::types::Param;

/// Non-blocking libpq connection.
pub struct LibpqSession {
    conn: *mut ffi::PGconn,
    /// The previous `PQgetResult` returned a command result, so the next
    /// null is the end-of-command marker rather than "nothing ready"
    after_result: bool,
    /// The last flush left part of the output buffer unwritten
    pending_flush: bool,
}

// SAFETY: the PGconn is owned exclusively by this session and libpq permits
// using a connection from any thread as long as calls are not concurrent.
// The pipeline only touches the session under its wire lock.
unsafe impl Send for LibpqSession {}

impl LibpqSession {
    /// Connect with `config`, then switch to non-blocking pipeline mode.
    pub fn connect(config: &PgConfig) -> Result<Self> {
        let conninfo = CString::new(config.to_conninfo()).map_err(|_| {
            Error::connection(
                ConnectionErrorKind::Connect,
                "connection string contains a NUL byte",
            )
        })?;

        // SAFETY: conninfo is a valid C string for the duration of the call
        let conn = unsafe { ffi::PQconnectdb(conninfo.as_ptr()) };
        if conn.is_null() {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                "libpq could not allocate a connection",
            ));
        }
        // Owns conn from here on, so every early return finishes it
        let session = Self {
            conn,
            after_result: false,
            pending_flush: false,
        };

        // SAFETY: conn is a valid handle returned by PQconnectdb
        if unsafe { ffi::PQstatus(conn) } != ffi::CONNECTION_OK {
            return Err(session.failure(ConnectionErrorKind::Connect));
        }
        // SAFETY: conn is valid and connected
        if unsafe { ffi::PQsetnonblocking(conn, 1) } != 0 {
            return Err(session.failure(ConnectionErrorKind::Connect));
        }
        // SAFETY: conn is valid, connected and idle
        if unsafe { ffi::PQenterPipelineMode(conn) } != 1 {
            return Err(session.failure(ConnectionErrorKind::Connect));
        }

        tracing::info!(
            addr = %config.socket_addr(),
            database = %config.database,
            "Connected to PostgreSQL"
        );
        Ok(session)
    }

    fn failure(&self, kind: ConnectionErrorKind) -> Error {
        Error::connection(kind, self.error_message())
    }

    fn send_failure(&self) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Execute,
            sql: None,
            message: self.error_message(),
        })
    }

    /// Close the current request with a sync point and push it out.
    ///
    /// Runs after libpq has accepted the command, so a failure here is a
    /// connection error: the command may still reach the server.
    fn sync(&mut self) -> Result<()> {
        // SAFETY: conn is valid for the lifetime of self
        if unsafe { ffi::PQpipelineSync(self.conn) } != 1 {
            return Err(self.failure(ConnectionErrorKind::Disconnected));
        }
        self.flush_output().map(|_| ())
    }

    fn flush_output(&mut self) -> Result<bool> {
        // SAFETY: conn is valid
        let rc = unsafe { ffi::PQflush(self.conn) };
        if rc < 0 {
            return Err(self.failure(ConnectionErrorKind::Disconnected));
        }
        self.pending_flush = rc == 1;
        Ok(!self.pending_flush)
    }
}

impl Drop for LibpqSession {
    fn drop(&mut self) {
        // SAFETY: conn is valid and not used after this point
        unsafe { ffi::PQfinish(self.conn) };
        tracing::debug!("Closed libpq connection");
    }
}

impl Session for LibpqSession {
    fn socket(&self) -> Option<i32> {
        // SAFETY: conn is valid
        let fd = unsafe { ffi::PQsocket(self.conn) };
        (fd >= 0).then_some(fd)
    }

    fn send_prepare(&mut self, name: &str, sql: &str, param_count: usize) -> Result<()> {
        let c_name = c_string(name)?;
        let c_sql = c_string(sql)?;
        let n_params = c_count(param_count)?;

        // SAFETY: both strings outlive the call; null paramTypes lets the
        // server infer every parameter type
        let ok = unsafe {
            ffi::PQsendPrepare(self.conn, c_name.as_ptr(), c_sql.as_ptr(), n_params, ptr::null())
        };
        if ok != 1 {
            return Err(self.send_failure());
        }
        self.sync()
    }

    fn send_query_prepared(&mut self, name: &str, params: &[Param]) -> Result<()> {
        let c_name = c_string(name)?;
        let values = params
            .iter()
            .map(|p| p.as_deref().map(c_string).transpose())
            .collect::<Result<Vec<Option<CString>>>>()?;
        let pointers: Vec<*const c_char> = values
            .iter()
            .map(|v| v.as_ref().map_or(ptr::null(), |s| s.as_ptr()))
            .collect();
        let n_params = c_count(pointers.len())?;

        // SAFETY: `values` owns every non-null pointer in `pointers` and both
        // outlive the call; null lengths and formats mean text parameters
        let ok = unsafe {
            ffi::PQsendQueryPrepared(
                self.conn,
                c_name.as_ptr(),
                n_params,
                pointers.as_ptr(),
                ptr::null(),
                ptr::null(),
                0,
            )
        };
        if ok != 1 {
            return Err(self.send_failure());
        }
        self.sync()
    }

    fn wants_write(&self) -> bool {
        self.pending_flush
    }

    fn flush(&mut self) -> Result<bool> {
        self.flush_output()
    }

    fn consume_input(&mut self) -> Result<()> {
        // SAFETY: conn is valid
        if unsafe { ffi::PQconsumeInput(self.conn) } != 1 {
            return Err(self.failure(ConnectionErrorKind::Disconnected));
        }
        if self.pending_flush {
            self.flush_output()?;
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        // SAFETY: conn is valid; PQisBusy only inspects the input buffer
        unsafe { ffi::PQisBusy(self.conn) == 1 }
    }

    fn next_result(&mut self) -> Option<Box<dyn RawResult>> {
        loop {
            if self.is_busy() {
                return None;
            }
            // SAFETY: conn is valid and not busy, so this does not block
            let res = unsafe { ffi::PQgetResult(self.conn) };
            if res.is_null() {
                if std::mem::take(&mut self.after_result) {
                    continue;
                }
                return None;
            }

            let result = PqResult::new(res);
            match result.status {
                ffi::PGRES_PIPELINE_SYNC => {}
                _ => {
                    self.after_result = true;
                    return Some(Box::new(result));
                }
            }
        }
    }

    fn error_message(&self) -> String {
        // SAFETY: conn is valid; the message lives until the next libpq call
        unsafe { ffi::message(ffi::PQerrorMessage(self.conn)) }
    }
}

impl std::fmt::Debug for LibpqSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibpqSession")
            .field("socket", &self.socket())
            .finish_non_exhaustive()
    }
}

/// Owned `PGresult`.
struct PqResult {
    res: *mut ffi::PGresult,
    status: c_int,
    error: Option<String>,
    rows: usize,
    fields: usize,
}

// SAFETY: a PGresult is never modified after PQgetResult returns it, so
// reads from several threads are sound. It is freed exactly once, in Drop.
unsafe impl Send for PqResult {}
unsafe impl Sync for PqResult {}

impl PqResult {
    fn new(res: *mut ffi::PGresult) -> Self {
        // SAFETY: res is a non-null result owned by this value
        let (status, rows, fields) = unsafe {
            (
                ffi::PQresultStatus(res),
                ffi::PQntuples(res),
                ffi::PQnfields(res),
            )
        };
        let error = match status {
            ffi::PGRES_PIPELINE_ABORTED => Some("pipeline aborted by an earlier error".to_string()),
            ffi::PGRES_BAD_RESPONSE | ffi::PGRES_NONFATAL_ERROR | ffi::PGRES_FATAL_ERROR => {
                // SAFETY: res is valid; the message is copied out
                Some(unsafe { ffi::message(ffi::PQresultErrorMessage(res)) })
            }
            _ => None,
        };
        Self {
            res,
            status,
            error,
            rows: usize::try_from(rows).unwrap_or(0),
            fields: usize::try_from(fields).unwrap_or(0),
        }
    }

    fn cell(&self, row: usize, col: usize) -> Option<(c_int, c_int)> {
        if row >= self.rows || col >= self.fields {
            return None;
        }
        Some((c_int::try_from(row).ok()?, c_int::try_from(col).ok()?))
    }
}

impl Drop for PqResult {
    fn drop(&mut self) {
        // SAFETY: res is owned by self and freed only here
        unsafe { ffi::PQclear(self.res) };
    }
}

impl RawResult for PqResult {
    fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn row_count(&self) -> usize {
        self.rows
    }

    fn field_count(&self) -> usize {
        self.fields
    }

    fn field_name(&self, col: usize) -> Option<&str> {
        if col >= self.fields {
            return None;
        }
        let col = c_int::try_from(col).ok()?;
        // SAFETY: col is in range; the name lives as long as the result
        unsafe { ffi::borrowed(ffi::PQfname(self.res, col)) }
    }

    fn field_index(&self, name: &str) -> Option<usize> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: res is valid and c_name outlives the call
        let index = unsafe { ffi::PQfnumber(self.res, c_name.as_ptr()) };
        usize::try_from(index).ok()
    }

    fn field_type(&self, col: usize) -> u32 {
        match c_int::try_from(col) {
            // SAFETY: col is in range
            Ok(c) if col < self.fields => unsafe { ffi::PQftype(self.res, c) },
            _ => 0,
        }
    }

    fn value(&self, row: usize, col: usize) -> Option<&str> {
        let (r, c) = self.cell(row, col)?;
        // SAFETY: (r, c) is in range; values live as long as the result
        unsafe {
            if ffi::PQgetisnull(self.res, r, c) == 1 {
                return None;
            }
            ffi::borrowed(ffi::PQgetvalue(self.res, r, c))
        }
    }
}

impl PgPipeline<LibpqSession> {
    /// Open a libpq connection and wrap it in a pipeline.
    ///
    /// ```ignore
    /// let pipeline = PgPipeline::connect(&PgConfig::new("localhost", "app", "app"))?;
    /// pipeline.start(&reactor)?;
    /// ```
    pub fn connect(config: &PgConfig) -> Result<Self> {
        let session = LibpqSession::connect(config)?;
        Ok(Self::with_session(session, config))
    }
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Execute,
            sql: None,
            message: "text contains a NUL byte".to_string(),
        })
    })
}

fn c_count(n: usize) -> Result<c_int> {
    c_int::try_from(n).map_err(|_| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Execute,
            sql: None,
            message: format!("too many parameters: {n}"),
        })
    })
}

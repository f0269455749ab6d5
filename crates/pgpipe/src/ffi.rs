//! Low-level FFI bindings to libpq.
//!
//! Written by hand and limited to the asynchronous command API and pipeline
//! mode (libpq 14 or newer).

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(clippy::upper_case_acronyms)]

use std::ffi::{CStr, c_char, c_int};

/// Opaque connection handle.
#[repr(C)]
pub struct PGconn {
    _private: [u8; 0],
}

/// Opaque result handle.
#[repr(C)]
pub struct PGresult {
    _private: [u8; 0],
}

pub type Oid = u32;

// ConnStatusType
pub const CONNECTION_OK: c_int = 0;
pub const CONNECTION_BAD: c_int = 1;

// ExecStatusType
pub const PGRES_EMPTY_QUERY: c_int = 0;
pub const PGRES_COMMAND_OK: c_int = 1;
pub const PGRES_TUPLES_OK: c_int = 2;
pub const PGRES_COPY_OUT: c_int = 3;
pub const PGRES_COPY_IN: c_int = 4;
pub const PGRES_BAD_RESPONSE: c_int = 5;
pub const PGRES_NONFATAL_ERROR: c_int = 6;
pub const PGRES_FATAL_ERROR: c_int = 7;
pub const PGRES_COPY_BOTH: c_int = 8;
pub const PGRES_SINGLE_TUPLE: c_int = 9;
pub const PGRES_PIPELINE_SYNC: c_int = 10;
pub const PGRES_PIPELINE_ABORTED: c_int = 11;

#[link(name = "pq")]
unsafe extern "C" {
    // Connection management
    pub fn PQconnectdb(conninfo: *const c_char) -> *mut PGconn;
    pub fn PQstatus(conn: *const PGconn) -> c_int;
    pub fn PQfinish(conn: *mut PGconn);
    pub fn PQerrorMessage(conn: *const PGconn) -> *const c_char;
    pub fn PQsocket(conn: *const PGconn) -> c_int;
    pub fn PQsetnonblocking(conn: *mut PGconn, arg: c_int) -> c_int;

    // Pipeline mode
    pub fn PQenterPipelineMode(conn: *mut PGconn) -> c_int;
    pub fn PQpipelineSync(conn: *mut PGconn) -> c_int;

    // Asynchronous commands
    pub fn PQsendPrepare(
        conn: *mut PGconn,
        stmtName: *const c_char,
        query: *const c_char,
        nParams: c_int,
        paramTypes: *const Oid,
    ) -> c_int;

    pub fn PQsendQueryPrepared(
        conn: *mut PGconn,
        stmtName: *const c_char,
        nParams: c_int,
        paramValues: *const *const c_char,
        paramLengths: *const c_int,
        paramFormats: *const c_int,
        resultFormat: c_int,
    ) -> c_int;

    pub fn PQconsumeInput(conn: *mut PGconn) -> c_int;
    pub fn PQisBusy(conn: *mut PGconn) -> c_int;
    pub fn PQgetResult(conn: *mut PGconn) -> *mut PGresult;
    pub fn PQflush(conn: *mut PGconn) -> c_int;

    // Results
    pub fn PQresultStatus(res: *const PGresult) -> c_int;
    pub fn PQresultErrorMessage(res: *const PGresult) -> *const c_char;
    pub fn PQntuples(res: *const PGresult) -> c_int;
    pub fn PQnfields(res: *const PGresult) -> c_int;
    pub fn PQfname(res: *const PGresult, field_num: c_int) -> *const c_char;
    pub fn PQfnumber(res: *const PGresult, field_name: *const c_char) -> c_int;
    pub fn PQftype(res: *const PGresult, field_num: c_int) -> Oid;
    pub fn PQgetisnull(res: *const PGresult, tup_num: c_int, field_num: c_int) -> c_int;
    pub fn PQgetvalue(res: *const PGresult, tup_num: c_int, field_num: c_int) -> *const c_char;
    pub fn PQclear(res: *mut PGresult);
}

/// Copy a libpq message, trimming the trailing newline libpq appends.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives the
/// call.
pub unsafe fn message(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract
    let text = unsafe { CStr::from_ptr(ptr) };
    text.to_string_lossy().trim_end().to_string()
}

/// Borrow a libpq string for the lifetime of its owner.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string valid for `'a`.
pub unsafe fn borrowed<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and valid for 'a per the caller's contract
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

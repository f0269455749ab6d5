//! Query results.
//!
//! A [`ResultSet`] shares ownership of the buffer the session handed back
//! for one request. Rows are borrowed views into it and decode their
//! columns lazily, so a failed typed access never disturbs the set or any
//! later access.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use pgpipe_core::error::{
    ConnectionErrorKind, DecodeError, DecodeErrorKind, QueryError, QueryErrorKind,
};
use pgpipe_core::{Error, FromValue, Result, Value};

use crate::types::decode_value;

/// Tabular result buffer as produced by a client session.
///
/// All values are in PostgreSQL text format; `None` is SQL NULL.
pub trait RawResult: Send + Sync {
    /// Server error message, if the request failed.
    fn error_message(&self) -> Option<&str>;

    /// Number of rows.
    fn row_count(&self) -> usize;

    /// Number of columns.
    fn field_count(&self) -> usize;

    /// Name of the column at `col`.
    fn field_name(&self, col: usize) -> Option<&str>;

    /// Index of the column called `name`.
    fn field_index(&self, name: &str) -> Option<usize> {
        (0..self.field_count()).find(|&i| self.field_name(i) == Some(name))
    }

    /// Type OID of the column at `col`.
    fn field_type(&self, col: usize) -> u32;

    /// Text value at (`row`, `col`); `None` for NULL.
    fn value(&self, row: usize, col: usize) -> Option<&str>;
}

/// Owned in-memory result.
///
/// Used for results the engine synthesises itself and by the scripted
/// session.
#[derive(Debug, Clone, Default)]
pub struct TextResult {
    names: Vec<String>,
    types: Vec<u32>,
    name_to_index: HashMap<String, usize>,
    rows: Vec<Vec<Option<String>>>,
    error: Option<String>,
}

impl TextResult {
    /// A successful result with the given `(name, type oid)` columns and no
    /// rows yet.
    pub fn new<N: Into<String>>(columns: impl IntoIterator<Item = (N, u32)>) -> Self {
        let mut result = Self::default();
        for (i, (name, oid)) in columns.into_iter().enumerate() {
            let name = name.into();
            result.name_to_index.entry(name.clone()).or_insert(i);
            result.names.push(name);
            result.types.push(oid);
        }
        result
    }

    /// A successful result with no columns, as for a command like `UPDATE`.
    pub fn command() -> Self {
        Self::default()
    }

    /// A failed result carrying a server error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Append a row. Missing trailing columns are NULL, extra ones dropped.
    pub fn row<V: Into<Option<String>>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        let mut row: Vec<Option<String>> = values.into_iter().map(Into::into).collect();
        row.resize(self.names.len(), None);
        self.rows.push(row);
        self
    }
}

impl RawResult for TextResult {
    fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn field_count(&self) -> usize {
        self.names.len()
    }

    fn field_name(&self, col: usize) -> Option<&str> {
        self.names.get(col).map(String::as_str)
    }

    fn field_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    fn field_type(&self, col: usize) -> u32 {
        self.types.get(col).copied().unwrap_or(0)
    }

    fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }
}

/// Why a request produced no usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection broke or was closed before the result arrived
    Connection,
    /// The statement failed to prepare
    Prepare,
    /// The request could not be sent
    Execute,
    /// The server reported an error while executing
    Server,
}

/// Immutable, cheaply clonable result of one request.
#[derive(Clone)]
pub struct ResultSet {
    raw: Arc<dyn RawResult>,
    failure: Option<(FailureKind, String)>,
}

impl ResultSet {
    /// Wrap a buffer returned by the session.
    pub fn from_raw(raw: Box<dyn RawResult>) -> Self {
        let failure = raw
            .error_message()
            .map(|message| (FailureKind::Server, message.to_string()));
        Self {
            raw: Arc::from(raw),
            failure,
        }
    }

    /// A result with no rows that reports `kind` and `message`.
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            raw: Arc::new(TextResult::default()),
            failure: Some((kind, message.into())),
        }
    }

    /// Error message; empty when the request succeeded.
    pub fn error(&self) -> String {
        self.failure
            .as_ref()
            .map(|(_, message)| message.clone())
            .unwrap_or_default()
    }

    /// Failure category, if the request failed.
    pub fn failure(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|(kind, _)| *kind)
    }

    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    /// Turn a failed result into an `Error`.
    pub fn check(&self) -> Result<&Self> {
        let Some((kind, message)) = &self.failure else {
            return Ok(self);
        };
        let message = message.clone();
        Err(match kind {
            FailureKind::Connection => Error::connection(ConnectionErrorKind::Disconnected, message),
            FailureKind::Prepare => query_error(QueryErrorKind::Prepare, message),
            FailureKind::Execute => query_error(QueryErrorKind::Execute, message),
            FailureKind::Server => query_error(QueryErrorKind::Server, message),
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.raw.row_count()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column names in order.
    pub fn columns(&self) -> Vec<&str> {
        (0..self.raw.field_count())
            .map(|i| self.raw.field_name(i).unwrap_or_default())
            .collect()
    }

    /// Row at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<Row<'_>> {
        (index < self.len()).then_some(Row { set: self, index })
    }

    /// Row at `index`, failing with `IndexOutOfRange`.
    pub fn row(&self, index: usize) -> Result<Row<'_>> {
        self.get(index).ok_or_else(|| {
            Error::Decode(DecodeError {
                kind: DecodeErrorKind::IndexOutOfRange,
                expected: "row index in range",
                actual: format!("row {} of {}", index, self.len()),
                column: None,
            })
        })
    }

    /// First row, if any.
    pub fn first(&self) -> Option<Row<'_>> {
        self.get(0)
    }

    /// Iterate over all rows. Each call starts from the first row.
    pub fn rows(&self) -> Rows<'_> {
        Rows {
            set: self,
            front: 0,
            back: self.len(),
        }
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("rows", &self.len())
            .field("columns", &self.columns())
            .field("failure", &self.failure)
            .finish()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = Row<'a>;
    type IntoIter = Rows<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows()
    }
}

fn query_error(kind: QueryErrorKind, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: None,
        message,
    })
}

/// Iterator over the rows of a [`ResultSet`].
#[derive(Debug, Clone)]
pub struct Rows<'a> {
    set: &'a ResultSet,
    front: usize,
    back: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let row = Row {
            set: self.set,
            index: self.front,
        };
        self.front += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for Rows<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(Row {
            set: self.set,
            index: self.back,
        })
    }
}

impl ExactSizeIterator for Rows<'_> {}

/// A column selector: a name or a zero-based index.
pub trait ColumnIndex {
    /// Resolve to a column index within `set`.
    fn column_in(&self, set: &ResultSet) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn column_in(&self, set: &ResultSet) -> Result<usize> {
        let count = set.raw.field_count();
        if *self < count {
            Ok(*self)
        } else {
            Err(Error::Decode(DecodeError {
                kind: DecodeErrorKind::IndexOutOfRange,
                expected: "column index in range",
                actual: format!("column {} of {}", self, count),
                column: None,
            }))
        }
    }
}

impl ColumnIndex for str {
    fn column_in(&self, set: &ResultSet) -> Result<usize> {
        set.raw.field_index(self).ok_or_else(|| {
            Error::Decode(DecodeError {
                kind: DecodeErrorKind::ColumnNotFound,
                expected: "existing column",
                actual: format!("no column named '{}'", self),
                column: Some(self.to_string()),
            })
        })
    }
}

impl ColumnIndex for String {
    fn column_in(&self, set: &ResultSet) -> Result<usize> {
        self.as_str().column_in(set)
    }
}

impl<T: ColumnIndex + ?Sized> ColumnIndex for &T {
    fn column_in(&self, set: &ResultSet) -> Result<usize> {
        (**self).column_in(set)
    }
}

/// Borrowed view of one row.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    set: &'a ResultSet,
    index: usize,
}

impl<'a> Row<'a> {
    /// Position of this row in its result set.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.set.raw.field_count()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the column `col` into a `Value`.
    pub fn get<C: ColumnIndex>(&self, col: C) -> Result<Value> {
        let i = col.column_in(self.set)?;
        let raw = &self.set.raw;
        decode_value(raw.field_type(i), raw.value(self.index, i))
            .map_err(|e| self.with_column(e, i))
    }

    /// Decode the column `col` into `T`, failing if its type differs.
    pub fn get_as<T: FromValue, C: ColumnIndex>(&self, col: C) -> Result<T> {
        let i = col.column_in(self.set)?;
        let value = self.get(i)?;
        T::from_owned(value).map_err(|e| self.with_column(e, i))
    }

    /// Whether the column `col` is NULL.
    pub fn is_null<C: ColumnIndex>(&self, col: C) -> Result<bool> {
        let i = col.column_in(self.set)?;
        Ok(self.set.raw.value(self.index, i).is_none())
    }

    /// Raw text of the column `col`; `None` for NULL.
    pub fn text<C: ColumnIndex>(&self, col: C) -> Result<Option<&'a str>> {
        let i = col.column_in(self.set)?;
        Ok(self.set.raw.value(self.index, i))
    }

    fn with_column(&self, err: Error, col: usize) -> Error {
        match err {
            Error::Decode(d) if d.column.is_none() => match self.set.raw.field_name(col) {
                Some(name) => Error::Decode(d.in_column(name)),
                None => Error::Decode(d),
            },
            other => other,
        }
    }
}

impl fmt::Debug for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for i in 0..self.len() {
            map.entry(
                &self.set.raw.field_name(i).unwrap_or_default(),
                &self.set.raw.value(self.index, i),
            );
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::oid;

    fn users() -> ResultSet {
        ResultSet::from_raw(Box::new(
            TextResult::new([("id", oid::INT8), ("name", oid::TEXT), ("score", oid::NUMERIC)])
                .row([Some("565197576026980365".to_string()), Some("alice".to_string()), None])
                .row([Some("2".to_string()), None, Some("9.5".to_string())]),
        ))
    }

    #[test]
    fn test_row_access() {
        let rs = users();
        assert!(rs.is_ok());
        assert_eq!(rs.error(), "");
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.columns(), vec!["id", "name", "score"]);

        let row = rs.first().unwrap();
        assert_eq!(row.get_as::<i64, _>("id").unwrap(), 565_197_576_026_980_365);
        assert_eq!(row.get(1usize).unwrap(), Value::Text("alice".to_string()));
    }

    #[test]
    fn test_null_regardless_of_oid() {
        let rs = users();
        assert_eq!(rs.row(0).unwrap().get("score").unwrap(), Value::Null);
        assert_eq!(rs.row(1).unwrap().get("name").unwrap(), Value::Null);
        assert!(rs.row(1).unwrap().is_null("name").unwrap());
        assert_eq!(rs.row(1).unwrap().get_as::<Option<String>, _>("name").unwrap(), None);
    }

    #[test]
    fn test_mismatch_does_not_poison_later_access() {
        let rs = users();
        let row = rs.first().unwrap();

        let err = row.get_as::<String, _>("id").unwrap_err();
        match &err {
            Error::Decode(d) => {
                assert_eq!(d.kind, DecodeErrorKind::TypeMismatch);
                assert_eq!(d.column.as_deref(), Some("id"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(row.get_as::<i64, _>("id").unwrap(), 565_197_576_026_980_365);
        assert_eq!(row.get_as::<String, _>(1usize).unwrap(), "alice");
    }

    #[test]
    fn test_lookup_failures() {
        let rs = users();
        let row = rs.first().unwrap();
        assert_eq!(
            row.get("missing").unwrap_err().decode_kind(),
            Some(DecodeErrorKind::ColumnNotFound)
        );
        assert_eq!(
            row.get(9usize).unwrap_err().decode_kind(),
            Some(DecodeErrorKind::IndexOutOfRange)
        );
        assert_eq!(
            rs.row(5).unwrap_err().decode_kind(),
            Some(DecodeErrorKind::IndexOutOfRange)
        );
        assert!(rs.get(2).is_none());
    }

    #[test]
    fn test_unsupported_type_is_lazy() {
        let rs = users();
        let row = rs.row(1).unwrap();
        let err = row.get("score").unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::UnsupportedType));
        // Raw text is still reachable
        assert_eq!(row.text("score").unwrap(), Some("9.5"));
    }

    #[test]
    fn test_rows_restart_each_call() {
        let rs = users();
        let ids: Vec<i64> = rs.rows().map(|r| r.get_as("id").unwrap()).collect();
        assert_eq!(ids, vec![565_197_576_026_980_365, 2]);

        let mut rows = rs.rows();
        assert_eq!(rows.len(), 2);
        rows.next();
        assert_eq!(rows.len(), 1);

        assert_eq!(rs.rows().count(), 2);
        assert_eq!(rs.rows().next_back().unwrap().index(), 1);
        assert_eq!((&rs).into_iter().count(), 2);
    }

    #[test]
    fn test_server_error_result() {
        let rs = ResultSet::from_raw(Box::new(TextResult::error(
            "relation \"nope\" does not exist",
        )));
        assert_eq!(rs.failure(), Some(FailureKind::Server));
        assert!(rs.error().contains("nope"));
        assert!(rs.is_empty());
        assert!(matches!(rs.check(), Err(Error::Query(_))));
    }

    #[test]
    fn test_failed_kinds_map_to_errors() {
        let conn = ResultSet::failed(FailureKind::Connection, "closed");
        assert!(conn.check().unwrap_err().is_connection_error());

        let prep = ResultSet::failed(FailureKind::Prepare, "syntax error");
        match prep.check().unwrap_err() {
            Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::Prepare),
            other => panic!("unexpected error: {other}"),
        }

        assert!(users().check().is_ok());
    }

    #[test]
    fn test_clone_shares_buffer() {
        let rs = users();
        let copy = rs.clone();
        drop(rs);
        assert_eq!(copy.first().unwrap().get_as::<String, _>("name").unwrap(), "alice");
    }
}

//! Pipelined PostgreSQL queries over a single non-blocking connection.
//!
//! `pgpipe` lets many callers share one connection without waiting on each
//! other. A query is written to the wire as soon as it is submitted and its
//! callback runs once the host's event loop reports the socket readable and
//! the result has arrived. Results are matched to callbacks strictly in
//! submission order.
//!
//! # Pieces
//!
//! - [`PgPipeline`]: the engine. Submits, drains, and tears down.
//! - [`Session`]: the non-blocking client underneath. [`LibpqSession`]
//!   (feature `libpq`) talks to a server; `testing::ScriptedSession`
//!   (feature `testing`) replays canned results.
//! - [`Reactor`]: the host event loop the pipeline registers its socket
//!   with.
//! - [`ResultSet`] and [`Row`]: results, decoded lazily by column type.
//! - [`StatementCache`]: SQL text to server-side prepared statement handle,
//!   per connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use pgpipe::{params, ManualReactor, PgConfig, PgPipeline};
//!
//! let config = PgConfig::new("localhost", "app", "app");
//! let pipeline = PgPipeline::connect(&config)?;
//! let reactor = ManualReactor::new();
//! pipeline.start(&reactor)?;
//!
//! pipeline.query(
//!     "SELECT name FROM users WHERE id = $1",
//!     params!(565197576026980365i64),
//!     |rs| {
//!         for row in &rs {
//!             println!("{}", row.get_as::<String, _>("name").unwrap_or_default());
//!         }
//!     },
//! );
//!
//! // in the host loop, whenever the socket is readable:
//! if let Some(fd) = pipeline.socket() {
//!     reactor.notify(fd);
//! }
//! ```

pub mod async_connection;
pub mod cache;
pub mod config;
pub mod connection;
pub mod queue;
pub mod reactor;
pub mod result;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

#[cfg(feature = "libpq")]
#[allow(unsafe_code)]
pub mod ffi;
#[cfg(feature = "libpq")]
#[allow(unsafe_code)]
pub mod libpq;

pub use async_connection::QueryFuture;
pub use cache::{NameGenerator, PreparedStatement, StatementCache};
pub use config::{PgConfig, SslMode};
pub use connection::{ConnectionState, Drain, PgPipeline, WeakPipeline};
#[cfg(feature = "libpq")]
pub use libpq::LibpqSession;
pub use queue::{PendingCallback, PendingExecute, PendingQueue};
pub use reactor::{ManualReactor, Reactor, Readiness};
pub use result::{ColumnIndex, FailureKind, RawResult, ResultSet, Row, Rows, TextResult};
pub use session::Session;
pub use types::{Param, ToParam};

pub use pgpipe_core::{Error, FromValue, Registry, Result, Value};

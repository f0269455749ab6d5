use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread;

use pgpipe::testing::{ScriptHandle, ScriptedSession, SentRequest};
use pgpipe::types::oid;
use pgpipe::{
    ConnectionState, Drain, Error, FailureKind, ManualReactor, NameGenerator, PgConfig,
    PgPipeline, Registry, ResultSet, TextResult, Value, params,
};
use pgpipe_core::DecodeErrorKind;

const USERS_BY_ID: &str = "SELECT * FROM users WHERE id = $1";

/// Answers prepares with an ack and executes with one `(id, name)` row
/// echoing the first parameter.
fn users_session() -> ScriptedSession {
    ScriptedSession::new().with_responder(|req| match req {
        SentRequest::Prepare { .. } => TextResult::command(),
        SentRequest::Execute { params, .. } => {
            TextResult::new([("id", oid::INT8), ("name", oid::TEXT)])
                .row([params.first().cloned().flatten(), Some("craig".to_string())])
        }
    })
}

fn pipeline(session: ScriptedSession) -> (PgPipeline<ScriptedSession>, ScriptHandle) {
    let script = session.handle();
    let pipeline = PgPipeline::with_names(session, NameGenerator::with_seed(7, 8));
    (pipeline, script)
}

fn sink() -> (Sender<ResultSet>, Receiver<ResultSet>) {
    mpsc::channel()
}

fn deliver(tx: &Sender<ResultSet>) -> impl FnOnce(ResultSet) + Send + 'static {
    let tx = tx.clone();
    move |rs| {
        let _ = tx.send(rs);
    }
}

#[test]
fn test_first_query_sends_prepare_then_execute() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, params!(565197576026980365i64), deliver(&tx));

    let sent = script.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].is_prepare());
    assert!(!sent[1].is_prepare());
    assert_eq!(sent[0].name(), sent[1].name());
    assert!(sent[0].name().starts_with("pgpipe_"));
    assert_eq!(pipeline.pending(), 2);

    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(2));
    let rs = rx.try_recv().unwrap();
    assert!(rx.try_recv().is_err(), "prepare ack must not reach the caller");

    assert!(rs.is_ok());
    assert_eq!(rs.len(), 1);
    assert!(pipeline.is_prepared(USERS_BY_ID));
    assert_eq!(pipeline.pending(), 0);
}

#[test]
fn test_bigint_round_trip() {
    let (pipeline, _script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, params!(565197576026980365i64), deliver(&tx));
    pipeline.on_readable().unwrap();

    let rs = rx.try_recv().unwrap();
    let row = rs.first().unwrap();
    assert_eq!(row.get_as::<i64, _>("id").unwrap(), 565197576026980365);
    assert_eq!(row.get("id").unwrap(), Value::BigInt(565197576026980365));
    assert_eq!(row.get_as::<String, _>("name").unwrap(), "craig");
}

#[test]
fn test_repeated_sql_prepared_once() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    // Still in flight: pipelines behind the first prepare
    pipeline.query(USERS_BY_ID, [2i64], deliver(&tx));
    assert_eq!(script.prepare_count(), 1);
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(3));

    // Acknowledged: served from the cache
    pipeline.query(USERS_BY_ID, [3i64], deliver(&tx));
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(1));

    assert_eq!(script.prepare_count(), 1);
    let sent = script.sent();
    assert_eq!(sent.len(), 4);
    assert!(sent.iter().all(|r| r.name() == sent[0].name()));
    assert_eq!(pipeline.cached_statements(), 1);

    let ids: Vec<i64> = rx
        .try_iter()
        .map(|rs| rs.first().unwrap().get_as::<i64, _>("id").unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn test_results_delivered_in_submission_order() {
    let session = ScriptedSession::new().with_responder(|req| match req {
        SentRequest::Prepare { .. } => TextResult::command(),
        SentRequest::Execute { params, .. } => {
            TextResult::new([("n", oid::INT4)]).row(params.iter().cloned())
        }
    });
    let (pipeline, script) = pipeline(session);
    let (tx, rx) = sink();

    pipeline.query("SELECT $1::int4", [1i32], deliver(&tx));
    pipeline.query("SELECT $1::int4 + 0", [2i32], deliver(&tx));
    pipeline.query("SELECT $1::int4", [3i32], deliver(&tx));
    pipeline.query("SELECT $1::int4 * 1", [4i32], deliver(&tx));

    assert_eq!(script.prepare_count(), 3);
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(7));

    let values: Vec<i32> = rx
        .try_iter()
        .map(|rs| rs.first().unwrap().get_as::<i32, _>(0usize).unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
    assert_eq!(pipeline.cached_statements(), 3);
}

#[test]
fn test_each_connection_uses_its_own_names() {
    let (first, first_script) = pipeline(users_session());
    let second_session = users_session();
    let second_script = second_session.handle();
    let second = PgPipeline::with_names(second_session, NameGenerator::with_seed(8, 8));

    first.query(USERS_BY_ID, [1i64], |_| {});
    second.query(USERS_BY_ID, [1i64], |_| {});

    assert_ne!(first_script.sent()[0].name(), second_script.sent()[0].name());
}

#[test]
fn test_null_column() {
    let session = ScriptedSession::new().with_responder(|req| match req {
        SentRequest::Prepare { .. } => TextResult::command(),
        SentRequest::Execute { .. } => TextResult::new([("id", oid::INT8), ("nickname", oid::TEXT)])
            .row([Some("1".to_string()), None]),
    });
    let (pipeline, _script) = pipeline(session);
    let (tx, rx) = sink();

    pipeline.query("SELECT id, nickname FROM users LIMIT 1", params!(), deliver(&tx));
    pipeline.on_readable().unwrap();

    let rs = rx.try_recv().unwrap();
    let row = rs.first().unwrap();
    assert_eq!(row.get("nickname").unwrap(), Value::Null);
    assert!(row.is_null("nickname").unwrap());
    assert_eq!(row.get_as::<Option<String>, _>("nickname").unwrap(), None);

    let err = row.get_as::<String, _>("nickname").unwrap_err();
    assert_eq!(err.decode_kind(), Some(DecodeErrorKind::TypeMismatch));
}

#[test]
fn test_type_mismatch_leaves_row_usable() {
    let (pipeline, _script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [42i64], deliver(&tx));
    pipeline.on_readable().unwrap();
    let rs = rx.try_recv().unwrap();
    let row = rs.first().unwrap();

    let err = row.get_as::<String, _>("id").unwrap_err();
    assert!(err.is_decode_error());
    assert_eq!(err.decode_kind(), Some(DecodeErrorKind::TypeMismatch));
    assert!(err.to_string().contains("'id'"));

    assert_eq!(row.get_as::<i64, _>("id").unwrap(), 42);
    assert_eq!(
        row.get("missing").unwrap_err().decode_kind(),
        Some(DecodeErrorKind::ColumnNotFound)
    );
    assert_eq!(
        row.get(9usize).unwrap_err().decode_kind(),
        Some(DecodeErrorKind::IndexOutOfRange)
    );
}

#[test]
fn test_incomplete_result_dispatches_nothing() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    script.set_busy(true);

    assert_eq!(pipeline.on_readable().unwrap(), Drain::Busy);
    assert!(rx.try_recv().is_err());
    assert_eq!(pipeline.pending(), 2);

    script.set_busy(false);
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(2));
    assert!(rx.try_recv().unwrap().is_ok());
}

#[test]
fn test_readable_with_nothing_arrived() {
    let (pipeline, _script) = pipeline(ScriptedSession::new());
    pipeline.query(USERS_BY_ID, [1i64], |_| {});

    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(0));
    assert_eq!(pipeline.pending(), 2);
}

#[test]
fn test_server_error_reaches_callback() {
    let session = ScriptedSession::new().with_responder(|req| match req {
        SentRequest::Prepare { .. } => TextResult::command(),
        SentRequest::Execute { .. } => {
            TextResult::error("duplicate key value violates unique constraint \"users_pkey\"")
        }
    });
    let (pipeline, _script) = pipeline(session);
    let (tx, rx) = sink();

    pipeline.query("INSERT INTO users (id) VALUES ($1)", [1i64], deliver(&tx));
    pipeline.on_readable().unwrap();

    let rs = rx.try_recv().unwrap();
    assert_eq!(rs.failure(), Some(FailureKind::Server));
    assert!(rs.error().contains("users_pkey"));
    assert!(rs.is_empty());
    // The statement itself prepared fine
    assert!(pipeline.is_prepared("INSERT INTO users (id) VALUES ($1)"));
}

#[test]
fn test_prepare_failure() {
    let session = ScriptedSession::new().with_responder(|req| match req {
        SentRequest::Prepare { sql, .. } if sql.starts_with("SELEC ") => {
            TextResult::error("syntax error at or near \"SELEC\"")
        }
        SentRequest::Prepare { .. } => TextResult::command(),
        SentRequest::Execute { name, .. } => {
            TextResult::error(format!("prepared statement \"{name}\" does not exist"))
        }
    });
    let (pipeline, script) = pipeline(session);
    let (tx, rx) = sink();

    pipeline.query("SELEC 1", params!(), deliver(&tx));
    pipeline.query("SELEC 1", params!(), deliver(&tx));
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(3));

    let results: Vec<ResultSet> = rx.try_iter().collect();
    assert_eq!(results.len(), 2);
    for rs in &results {
        assert_eq!(rs.failure(), Some(FailureKind::Prepare));
        assert!(rs.error().contains("syntax error"));
    }
    assert!(!pipeline.is_prepared("SELEC 1"));

    // Not cached, so the next submission prepares again
    pipeline.query("SELEC 1", params!(), deliver(&tx));
    assert_eq!(script.prepare_count(), 2);
}

#[test]
fn test_send_failure_resolves_synchronously() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    script.fail_next_send("could not send data to server: Broken pipe");
    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));

    let rs = rx.try_recv().unwrap();
    assert_eq!(rs.failure(), Some(FailureKind::Execute));
    assert!(rs.error().contains("Broken pipe"));
    assert_eq!(pipeline.pending(), 0);
    assert!(script.sent().is_empty());
    assert_eq!(pipeline.state(), ConnectionState::Open);
}

#[test]
fn test_execute_send_failure_after_cached_prepare() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    pipeline.on_readable().unwrap();
    assert!(rx.try_recv().unwrap().is_ok());

    script.fail_next_send("out of memory");
    pipeline.query(USERS_BY_ID, [2i64], deliver(&tx));

    assert_eq!(rx.try_recv().unwrap().failure(), Some(FailureKind::Execute));
    assert_eq!(pipeline.pending(), 0);
    assert_eq!(script.sent().len(), 2);
}

#[test]
fn test_lost_connection_while_sending_breaks_pipeline() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    script.break_next_send("could not send data to server: Connection reset by peer");
    pipeline.query(USERS_BY_ID, [2i64], deliver(&tx));

    // The second execute reached the session's buffer before the failure
    assert_eq!(script.sent().len(), 3);
    assert_eq!(pipeline.state(), ConnectionState::Broken);
    assert!(pipeline.last_error().unwrap().contains("Connection reset"));
    assert_eq!(pipeline.pending(), 0);

    let results: Vec<ResultSet> = rx.try_iter().collect();
    assert_eq!(results.len(), 2);
    assert!(
        results
            .iter()
            .all(|rs| rs.failure() == Some(FailureKind::Connection))
    );

    // Buffered answers are never handed to anyone
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Closed);
    assert!(rx.try_recv().is_err());
    assert_eq!(script.undelivered(), 3);
}

#[test]
fn test_partial_write_flushed_on_demand() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();

    script.stall_writes(2);
    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    assert!(pipeline.wants_write());

    // Nothing answers until the request is fully written
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(0));
    assert!(!pipeline.on_writable().unwrap());
    assert!(pipeline.on_writable().unwrap());
    assert!(!pipeline.wants_write());

    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(2));
    assert!(rx.try_recv().unwrap().is_ok());
}

#[test]
fn test_read_failure_breaks_connection() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    pipeline.query("SELECT now()", params!(), deliver(&tx));
    script.fail_pump("server closed the connection unexpectedly");

    let err = pipeline.on_readable().unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(pipeline.state(), ConnectionState::Broken);
    assert!(pipeline.last_error().unwrap().contains("closed the connection"));
    assert_eq!(pipeline.pending(), 0);

    let failures: Vec<FailureKind> = rx.try_iter().filter_map(|rs| rs.failure()).collect();
    assert_eq!(failures, vec![FailureKind::Connection, FailureKind::Connection]);

    // Later submissions fail immediately; reads report the closed state
    pipeline.query("SELECT 1", params!(), deliver(&tx));
    assert_eq!(rx.try_recv().unwrap().failure(), Some(FailureKind::Connection));
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Closed);
    assert!(pipeline.socket().is_none());
}

#[test]
fn test_unmatched_result_is_desync() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    script.push_result(TextResult::command());

    let err = pipeline.on_readable().unwrap_err();
    assert!(matches!(err, Error::QueueDesync(_)));
    assert_eq!(pipeline.state(), ConnectionState::Open);
}

#[test]
fn test_drop_fails_pending_and_releases_session() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    let (tx, rx) = sink();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    pipeline.query(USERS_BY_ID, [2i64], deliver(&tx));
    assert_eq!(pipeline.pending(), 3);

    drop(pipeline);

    let results: Vec<ResultSet> = rx.try_iter().collect();
    assert_eq!(results.len(), 2);
    assert!(
        results
            .iter()
            .all(|rs| rs.failure() == Some(FailureKind::Connection))
    );
    assert!(script.is_dropped());
}

#[test]
fn test_weak_handle_in_callback_allows_drop() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    let (tx, rx) = mpsc::channel();
    let weak = pipeline.downgrade();

    pipeline.query(USERS_BY_ID, [1i64], move |rs| {
        let _ = tx.send((rs.failure(), weak.upgrade().is_some()));
    });
    drop(pipeline);

    assert!(script.is_dropped());
    assert_eq!(rx.try_recv().unwrap(), (Some(FailureKind::Connection), false));
}

#[test]
fn test_close_releases_handle_held_by_callback() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    let (tx, rx) = sink();
    let held = pipeline.clone();

    pipeline.query(USERS_BY_ID, [1i64], move |rs| {
        let _ = tx.send(rs);
        drop(held);
    });
    pipeline.close();

    assert!(script.is_dropped());
    assert_eq!(rx.try_recv().unwrap().failure(), Some(FailureKind::Connection));
    drop(pipeline);
}

#[test]
fn test_close_is_idempotent() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    let (tx, rx) = sink();
    let other = pipeline.clone();

    pipeline.query(USERS_BY_ID, [1i64], deliver(&tx));
    pipeline.close();
    other.close();

    assert_eq!(rx.try_iter().count(), 1);
    assert_eq!(other.state(), ConnectionState::Closed);
    assert!(script.is_dropped());
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Closed);
}

#[test]
fn test_reactor_drives_pipeline() {
    let (pipeline, _script) = pipeline(users_session().with_socket(11));
    let reactor = ManualReactor::new();
    let (tx, rx) = sink();

    pipeline.start(&reactor).unwrap();
    assert!(reactor.is_registered(11));

    pipeline.query(USERS_BY_ID, [5i64], deliver(&tx));
    assert!(reactor.notify(11));
    let rs = rx.try_recv().unwrap();
    assert_eq!(rs.first().unwrap().get_as::<i64, _>(0usize).unwrap(), 5);
    assert!(reactor.is_registered(11));

    // The registration does not keep the connection alive
    drop(pipeline);
    assert!(reactor.notify(11));
    assert!(!reactor.is_registered(11));
}

#[test]
fn test_reactor_watches_writes_only_while_output_pending() {
    let (pipeline, script) = pipeline(users_session());
    let reactor = ManualReactor::new();
    let (tx, rx) = sink();

    pipeline.start(&reactor).unwrap();
    assert!(!reactor.is_write_registered(7));

    script.stall_writes(2);
    pipeline.query(USERS_BY_ID, [3i64], deliver(&tx));
    assert!(reactor.is_write_registered(7));

    assert!(reactor.notify(7));
    assert!(rx.try_recv().is_err());

    assert!(reactor.notify_writable(7));
    assert!(reactor.is_write_registered(7));
    assert!(reactor.notify_writable(7));
    assert!(!reactor.is_write_registered(7));

    assert!(reactor.notify(7));
    let rs = rx.try_recv().unwrap();
    assert_eq!(rs.first().unwrap().get_as::<i64, _>("id").unwrap(), 3);

    // Fully written requests never ask for write readiness
    pipeline.query(USERS_BY_ID, [4i64], deliver(&tx));
    assert!(!reactor.is_write_registered(7));
}

#[test]
fn test_reactor_deregisters_on_read_failure() {
    let (pipeline, script) = pipeline(ScriptedSession::new());
    let reactor = ManualReactor::new();
    pipeline.start(&reactor).unwrap();

    script.fail_pump("connection reset by peer");
    assert!(reactor.notify(7));
    assert!(!reactor.is_registered(7));
    assert_eq!(pipeline.state(), ConnectionState::Broken);
}

#[test]
fn test_start_requires_open_connection() {
    let (pipeline, _script) = pipeline(ScriptedSession::new());
    pipeline.close();

    let err = pipeline.start(&ManualReactor::new()).unwrap_err();
    assert!(err.is_connection_error());
}

#[test]
fn test_drain_is_not_reentrant() {
    let (pipeline, _script) = pipeline(users_session());
    let (drain_tx, drain_rx) = mpsc::channel();
    let inner = pipeline.clone();

    pipeline.query(USERS_BY_ID, [1i64], move |_rs| {
        let _ = drain_tx.send(inner.on_readable());
    });
    assert_eq!(pipeline.on_readable().unwrap(), Drain::Dispatched(2));

    let nested = drain_rx.try_recv().unwrap();
    assert_eq!(nested.unwrap(), Drain::InProgress);
}

#[test]
fn test_callback_may_submit() {
    let (pipeline, script) = pipeline(users_session());
    let (tx, rx) = sink();
    let weak = pipeline.downgrade();
    let follow_up = deliver(&tx);

    pipeline.query(USERS_BY_ID, [1i64], move |rs| {
        let id = rs.first().unwrap().get_as::<i64, _>("id").unwrap();
        if let Some(inner) = weak.upgrade() {
            inner.query(USERS_BY_ID, [id + 1], follow_up);
        }
    });
    pipeline.on_readable().unwrap();
    assert_eq!(script.sent().len(), 3);

    pipeline.on_readable().unwrap();
    let rs = rx.try_recv().unwrap();
    assert_eq!(rs.first().unwrap().get_as::<i64, _>("id").unwrap(), 2);
}

#[test]
fn test_concurrent_submitters_get_their_own_results() {
    const THREADS: usize = 8;
    const PER_THREAD: i64 = 25;

    let (pipeline, script) = pipeline(users_session());
    let barrier = Arc::new(Barrier::new(THREADS));
    let (tx, rx) = mpsc::channel::<(i64, i64)>();

    let handles: Vec<_> = (0..THREADS as i64)
        .map(|t| {
            let pipeline = pipeline.clone();
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let id = t * 1000 + i;
                    let tx = tx.clone();
                    pipeline.query(USERS_BY_ID, [id], move |rs| {
                        let got = rs.first().unwrap().get_as::<i64, _>("id").unwrap();
                        let _ = tx.send((id, got));
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    drop(tx);

    pipeline.on_readable().unwrap();
    let pairs: Vec<(i64, i64)> = rx.iter().collect();
    assert_eq!(pairs.len(), THREADS * PER_THREAD as usize);
    assert!(pairs.iter().all(|(want, got)| want == got));
    assert_eq!(script.prepare_count(), 1);
    assert_eq!(pipeline.pending(), 0);
}

#[test]
fn test_submit_with_prebuilt_params() {
    let session = users_session();
    let script = session.handle();
    let pipeline = PgPipeline::with_session(session, &PgConfig::default());

    pipeline.submit(USERS_BY_ID, vec![Some("9".to_string()), None], |_| {});
    match &script.sent()[1] {
        SentRequest::Execute { params, .. } => {
            assert_eq!(params, &vec![Some("9".to_string()), None]);
        }
        other => panic!("expected execute, got {other:?}"),
    }
}

#[test]
fn test_registry_wires_one_shared_connection() {
    let session = users_session();
    let script = session.handle();
    let session = std::sync::Mutex::new(Some(session));

    let mut registry = Registry::new();
    registry
        .register("config", |_| Ok(PgConfig::new("localhost", "app", "app")))
        .register_singleton("db", move |registry| {
            let config: PgConfig = registry.resolve("config")?;
            let session = session
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take()
                .ok_or_else(|| Error::Custom("session already used".to_string()))?;
            Ok(PgPipeline::with_session(session, &config))
        });

    let db = registry.shared::<PgPipeline<ScriptedSession>>("db").unwrap();
    let again = registry.shared::<PgPipeline<ScriptedSession>>("db").unwrap();
    assert!(Arc::ptr_eq(&db, &again));

    db.query(USERS_BY_ID, [1i64], |_| {});
    assert_eq!(script.prepare_count(), 1);
    assert!(registry.resolve::<PgPipeline<ScriptedSession>>("db").is_err());
}

//! Transaction & Isolation Tests
//!
//! Read-your-writes through the overlay, rollback isolation, nested
//! savepoints across tables, commit atomicity, change events, and the
//! schema-change guard between prepare and execute.

use quereus::{Database, Result, Row, StatusCode, Value};

// ============================================================================
// Test Helpers
// ============================================================================

fn db_with_t() -> Database {
    let db = Database::new().expect("open");
    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ())
        .expect("create");
    db
}

fn count(db: &Database, sql: &str) -> i64 {
    let rows: Vec<Row> = db
        .eval(sql, ())
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    match rows[0].get(0) {
        Some(Value::Integer(n)) => *n,
        other => panic!("expected integer, got {other:?}"),
    }
}

fn names(db: &Database, sql: &str) -> Vec<String> {
    db.eval(sql, ())
        .expect("eval")
        .map(|r| match r.expect("row").get(0) {
            Some(Value::Text(s)) => s.clone(),
            other => panic!("expected text, got {other:?}"),
        })
        .collect()
}

// ============================================================================
// Read-your-writes
// ============================================================================

#[test]
fn test_read_your_writes_insert() {
    let db = db_with_t();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (4, 'd')", ()).expect("insert");
    assert_eq!(names(&db, "SELECT name FROM t WHERE id = 4"), vec!["d"]);
    db.exec("ROLLBACK", ()).expect("rollback");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 0);
}

#[test]
fn test_read_your_writes_delete() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("seed");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("DELETE FROM t WHERE id = 1", ()).expect("delete");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 0);
    db.exec("ROLLBACK", ()).expect("rollback");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1);
}

#[test]
fn test_read_your_writes_update_exactly_once() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1, 'old')", ()).expect("seed");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("UPDATE t SET name = 'new' WHERE id = 1", ()).expect("update");
    let visible = names(&db, "SELECT name FROM t");
    assert_eq!(visible, vec!["new"]);
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(names(&db, "SELECT name FROM t"), vec!["new"]);
}

#[test]
fn test_overlay_merge_keeps_pk_order() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'), (3,'c'), (5,'e')", ())
        .expect("seed");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (2,'b'), (4,'d')", ()).expect("insert");
    db.exec("DELETE FROM t WHERE id = 3", ()).expect("delete");
    db.exec("UPDATE t SET name = 'E' WHERE id = 5", ()).expect("update");
    // Merged scan: base and overlay interleave in key order, the
    // tombstone hides 3, the update substitutes at 5
    assert_eq!(names(&db, "SELECT name FROM t"), vec!["a", "b", "d", "E"]);
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(names(&db, "SELECT name FROM t"), vec!["a", "b", "d", "E"]);
}

// ============================================================================
// Commit / rollback semantics
// ============================================================================

#[test]
fn test_commit_persists() {
    let db = db_with_t();
    db.exec("BEGIN; INSERT INTO t VALUES (1, 'x'); COMMIT;", ())
        .expect("txn program");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1);
}

#[test]
fn test_rollback_isolation() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1, 'keep')", ()).expect("seed");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (2, 'drop')", ()).expect("insert");
    db.exec("UPDATE t SET name = 'mut' WHERE id = 1", ()).expect("update");
    db.exec("ROLLBACK", ()).expect("rollback");
    assert_eq!(names(&db, "SELECT name FROM t"), vec!["keep"]);
}

#[test]
fn test_nested_begin_rejected() {
    let db = db_with_t();
    db.exec("BEGIN", ()).expect("begin");
    let err = db.exec("BEGIN", ()).expect_err("nested");
    assert_eq!(err.code, StatusCode::Misuse);
}

#[test]
fn test_commit_without_transaction_rejected() {
    let db = db_with_t();
    let err = db.exec("COMMIT", ()).expect_err("no txn");
    assert_eq!(err.code, StatusCode::Misuse);
}

#[test]
fn test_transaction_spans_tables() {
    let db = db_with_t();
    db.exec("CREATE TABLE u (id INTEGER PRIMARY KEY)", ()).expect("create u");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("insert t");
    db.exec("INSERT INTO u VALUES (9)", ()).expect("insert u");
    db.exec("ROLLBACK", ()).expect("rollback");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 0);
    assert_eq!(count(&db, "SELECT count(*) FROM u"), 0);
}

#[test]
fn test_failed_statement_keeps_explicit_transaction_open() {
    let db = db_with_t();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("insert");
    // The duplicate fails, but the transaction is the caller's to end
    let err = db
        .exec("INSERT INTO t VALUES (1, 'dup')", ())
        .expect_err("dup");
    assert_eq!(err.code, StatusCode::Constraint);
    assert!(db.is_in_transaction());
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1);
}

// ============================================================================
// Savepoints
// ============================================================================

#[test]
fn test_savepoint_rollback_literal_scenario() {
    let db = db_with_t();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (1, 'x')", ()).expect("insert 1");
    db.exec("SAVEPOINT s1", ()).expect("savepoint");
    db.exec("INSERT INTO t VALUES (2, 'y')", ()).expect("insert 2");
    db.exec("ROLLBACK TO s1", ()).expect("rollback to");
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1);
}

#[test]
fn test_savepoint_nesting_equals_plain_transaction() {
    let db = db_with_t();
    db.exec(
        "BEGIN; SAVEPOINT a; INSERT INTO t VALUES (1,'m'); \
         SAVEPOINT b; INSERT INTO t VALUES (2,'n'); \
         ROLLBACK TO a; COMMIT;",
        (),
    )
    .expect("nested savepoints");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 0);
}

#[test]
fn test_release_keeps_changes() {
    let db = db_with_t();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("SAVEPOINT s", ()).expect("savepoint");
    db.exec("INSERT INTO t VALUES (1, 'kept')", ()).expect("insert");
    db.exec("RELEASE s", ()).expect("release");
    // The savepoint is gone but its writes are not
    assert_eq!(
        db.exec("ROLLBACK TO s", ()).expect_err("gone").code,
        StatusCode::NotFound
    );
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 1);
}

#[test]
fn test_savepoint_opens_transaction() {
    let db = db_with_t();
    db.exec("SAVEPOINT solo", ()).expect("savepoint");
    assert!(db.is_in_transaction());
    db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("insert");
    db.exec("ROLLBACK", ()).expect("rollback");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 0);
}

#[test]
fn test_savepoint_spans_late_enlisted_table() {
    let db = db_with_t();
    db.exec("CREATE TABLE late (id INTEGER PRIMARY KEY)", ())
        .expect("create");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("SAVEPOINT sp", ()).expect("savepoint");
    // `late` first touched after the savepoint exists
    db.exec("INSERT INTO late VALUES (1)", ()).expect("insert");
    db.exec("ROLLBACK TO sp", ()).expect("rollback to");
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(count(&db, "SELECT count(*) FROM late"), 0);
}

// ============================================================================
// Change events
// ============================================================================

#[test]
fn test_events_delivered_post_commit() {
    let db = db_with_t();
    let rx = db.on_data_change();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("insert");
    // Nothing leaks before commit
    assert!(rx.try_recv().is_err());
    db.exec("COMMIT", ()).expect("commit");
    let event = rx.try_recv().expect("event");
    assert_eq!(event.table, "t");
    assert_eq!(event.new_row, Some(vec![Value::Integer(1), Value::Text("a".into())]));
    assert!(!event.remote);
}

#[test]
fn test_rollback_emits_no_events() {
    let db = db_with_t();
    let rx = db.on_data_change();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("insert");
    db.exec("ROLLBACK", ()).expect("rollback");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_update_event_carries_old_and_new() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1, 'before')", ()).expect("seed");
    let rx = db.on_data_change();
    db.exec("UPDATE t SET name = 'after' WHERE id = 1", ()).expect("update");
    let event = rx.try_recv().expect("event");
    assert_eq!(
        event.old_row.as_ref().and_then(|r| r.get(1)).cloned(),
        Some(Value::Text("before".into()))
    );
    assert_eq!(
        event.new_row.as_ref().and_then(|r| r.get(1)).cloned(),
        Some(Value::Text("after".into()))
    );
}

// ============================================================================
// Schema-change detection
// ============================================================================

#[test]
fn test_schema_change_between_prepare_and_run() {
    let db = db_with_t();
    let mut select = db.prepare("SELECT * FROM t").expect("prepare");
    db.exec("DROP TABLE t", ()).expect("drop");
    let err = select.all().expect_err("stale");
    assert_eq!(err.code, StatusCode::SchemaChanged);
}

#[test]
fn test_schema_change_on_recreate() {
    let db = db_with_t();
    let mut select = db.prepare("SELECT * FROM t").expect("prepare");
    db.exec("DROP TABLE t", ()).expect("drop");
    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ())
        .expect("recreate");
    // Same name, different identity: still a schema change
    let err = select.all().expect_err("stale identity");
    assert_eq!(err.code, StatusCode::SchemaChanged);
    // A fresh prepare binds to the new table
    let mut fresh = db.prepare("SELECT * FROM t").expect("reprepare");
    assert!(fresh.all().expect("rows").is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_interrupt_cancels_statement() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b')", ()).expect("seed");
    let handle = db.interrupt_handle();
    handle.cancel();
    let err = db.eval("SELECT * FROM t", ()).expect_err("cancelled");
    assert_eq!(err.code, StatusCode::Cancelled);
    // Cancellation does not roll the session's transaction back
    handle.clear();
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO t VALUES (3,'c')", ()).expect("insert");
    handle.cancel();
    assert!(db.eval("SELECT * FROM t", ()).is_err());
    assert!(db.is_in_transaction());
    handle.clear();
    db.exec("COMMIT", ()).expect("commit");
    assert_eq!(count(&db, "SELECT count(*) FROM t"), 3);
}

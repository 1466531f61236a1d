//! End-to-End SQL Tests
//!
//! Full-pipeline coverage: parse → plan → emit → execute against the
//! memory module. Covers the statement surface (DDL, DML, SELECT with
//! joins/grouping/ordering/limits), expression semantics, parameters,
//! views, CTEs, and error surfaces.

use quereus::{Database, Params, Result, Row, StatusCode, Value};

// ============================================================================
// Test Helpers
// ============================================================================

fn db() -> Database {
    Database::new().expect("open database")
}

fn db_with_t() -> Database {
    let db = db();
    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ())
        .expect("create t");
    db
}

fn all(db: &Database, sql: &str) -> Vec<Row> {
    db.eval(sql, ())
        .expect("eval")
        .collect::<Result<Vec<_>>>()
        .expect("rows")
}

fn values(db: &Database, sql: &str) -> Vec<Vec<Value>> {
    all(db, sql)
        .into_iter()
        .map(|r| r.values().to_vec())
        .collect()
}

fn single(db: &Database, sql: &str) -> Value {
    let rows = values(db, sql);
    assert_eq!(rows.len(), 1, "expected one row from {sql}");
    rows[0][0].clone()
}

fn int(i: i64) -> Value {
    Value::Integer(i)
}

fn text(s: &str) -> Value {
    Value::Text(s.into())
}

// ============================================================================
// DDL and empty scans
// ============================================================================

#[test]
fn test_empty_select_after_create() {
    let db = db_with_t();
    assert_eq!(all(&db, "SELECT * FROM t").len(), 0);
}

#[test]
fn test_create_without_primary_key_is_rejected() {
    let db = db();
    let err = db
        .exec("CREATE TABLE nope (a INTEGER)", ())
        .expect_err("pk required");
    assert_eq!(err.code, StatusCode::Misuse);
}

#[test]
fn test_drop_table_then_select_fails() {
    let db = db_with_t();
    db.exec("DROP TABLE t", ()).expect("drop");
    let err = db.eval("SELECT * FROM t", ()).expect_err("gone");
    assert_eq!(err.code, StatusCode::NotFound);
}

#[test]
fn test_if_exists_variants() {
    let db = db();
    db.exec("DROP TABLE IF EXISTS missing", ()).expect("no-op drop");
    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY)", ())
        .expect("create");
    db.exec("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY)", ())
        .expect("no-op create");
}

// ============================================================================
// Insert / select round trips
// ============================================================================

#[test]
fn test_insert_select_in_pk_order() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b'),(3,'c')", ())
        .expect("insert");
    let rows = values(&db, "SELECT id, name FROM t ORDER BY id");
    assert_eq!(
        rows,
        vec![
            vec![int(1), text("a")],
            vec![int(2), text("b")],
            vec![int(3), text("c")],
        ]
    );
}

#[test]
fn test_unordered_insert_scans_in_pk_order() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (3,'c'),(1,'a'),(2,'b')", ())
        .expect("insert");
    // The primary scan itself is key-ordered; no ORDER BY needed
    let rows = values(&db, "SELECT id FROM t");
    assert_eq!(rows, vec![vec![int(1)], vec![int(2)], vec![int(3)]]);
}

#[test]
fn test_insert_with_column_list_and_defaults() {
    let db = db();
    db.exec(
        "CREATE TABLE d (id INTEGER PRIMARY KEY, kind TEXT DEFAULT 'plain', score REAL)",
        (),
    )
    .expect("create");
    db.exec("INSERT INTO d (id) VALUES (1)", ()).expect("insert");
    let rows = values(&db, "SELECT kind, score FROM d");
    assert_eq!(rows, vec![vec![text("plain"), Value::Null]]);
}

#[test]
fn test_insert_from_select() {
    let db = db_with_t();
    db.exec("CREATE TABLE copy (id INTEGER PRIMARY KEY, name TEXT)", ())
        .expect("create copy");
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b')", ()).expect("seed");
    db.exec("INSERT INTO copy SELECT id, upper(name) FROM t", ())
        .expect("insert-select");
    assert_eq!(single(&db, "SELECT name FROM copy WHERE id = 2"), text("B"));
}

#[test]
fn test_duplicate_pk_rejected() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a')", ()).expect("first");
    let err = db
        .exec("INSERT INTO t VALUES (1,'again')", ())
        .expect_err("dup");
    assert_eq!(err.code, StatusCode::Constraint);
    // The failed statement left nothing behind
    assert_eq!(single(&db, "SELECT count(*) FROM t"), int(1));
}

#[test]
fn test_affinity_applied_on_insert() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES ('7', 42)", ()).expect("insert");
    let rows = values(&db, "SELECT id, name, typeof(id), typeof(name) FROM t");
    assert_eq!(
        rows,
        vec![vec![int(7), text("42"), text("integer"), text("text")]]
    );
}

// ============================================================================
// Update / delete
// ============================================================================

#[test]
fn test_update_via_pk() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a')", ()).expect("insert");
    db.exec("UPDATE t SET name='A' WHERE id=1", ()).expect("update");
    assert_eq!(single(&db, "SELECT name FROM t WHERE id=1"), text("A"));
    assert_eq!(db.changes(), 1);
}

#[test]
fn test_update_expression_reads_old_row() {
    let db = db();
    db.exec("CREATE TABLE c (id INTEGER PRIMARY KEY, n INTEGER)", ())
        .expect("create");
    db.exec("INSERT INTO c VALUES (1, 10), (2, 20)", ()).expect("seed");
    db.exec("UPDATE c SET n = n + 1 WHERE id >= 1", ()).expect("update");
    let rows = values(&db, "SELECT n FROM c ORDER BY id");
    assert_eq!(rows, vec![vec![int(11)], vec![int(21)]]);
}

#[test]
fn test_update_changing_pk() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a')", ()).expect("insert");
    db.exec("UPDATE t SET id = 9 WHERE id = 1", ()).expect("move");
    let rows = values(&db, "SELECT id FROM t");
    assert_eq!(rows, vec![vec![int(9)]]);
}

#[test]
fn test_delete_with_predicate() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b'),(3,'c')", ())
        .expect("seed");
    db.exec("DELETE FROM t WHERE id > 1", ()).expect("delete");
    assert_eq!(db.changes(), 2);
    assert_eq!(single(&db, "SELECT count(*) FROM t"), int(1));
}

#[test]
fn test_not_null_constraint() {
    let db = db();
    db.exec(
        "CREATE TABLE n (id INTEGER PRIMARY KEY, req TEXT NOT NULL)",
        (),
    )
    .expect("create");
    let err = db
        .exec("INSERT INTO n VALUES (1, NULL)", ())
        .expect_err("null");
    assert_eq!(err.code, StatusCode::Constraint);
    assert!(err.message.contains("NOT NULL"));
}

#[test]
fn test_check_constraint() {
    let db = db();
    db.exec(
        "CREATE TABLE p (id INTEGER PRIMARY KEY, score REAL, CHECK (score >= 0))",
        (),
    )
    .expect("create");
    db.exec("INSERT INTO p VALUES (1, 0.5)", ()).expect("valid");
    let err = db
        .exec("INSERT INTO p VALUES (2, -1.0)", ())
        .expect_err("violation");
    assert_eq!(err.code, StatusCode::Constraint);
    assert!(err.message.contains("CHECK"));
    // CHECK evaluates against the candidate row on UPDATE too
    let err = db
        .exec("UPDATE p SET score = -3 WHERE id = 1", ())
        .expect_err("update violation");
    assert_eq!(err.code, StatusCode::Constraint);
}

// ============================================================================
// Expressions
// ============================================================================

#[test]
fn test_three_valued_logic() {
    let db = db();
    assert_eq!(single(&db, "SELECT NULL = NULL"), Value::Null);
    assert_eq!(single(&db, "SELECT NULL IS NULL"), int(1));
    assert_eq!(single(&db, "SELECT 1 = 1"), int(1));
    assert_eq!(single(&db, "SELECT NULL AND 0"), int(0));
    assert_eq!(single(&db, "SELECT NULL AND 1"), Value::Null);
    assert_eq!(single(&db, "SELECT NULL OR 1"), int(1));
    assert_eq!(single(&db, "SELECT NOT NULL"), Value::Null);
}

#[test]
fn test_arithmetic() {
    let db = db();
    assert_eq!(single(&db, "SELECT 1 + 2 * 3"), int(7));
    assert_eq!(single(&db, "SELECT 7 % 3"), int(1));
    assert_eq!(single(&db, "SELECT 1 / 0"), Value::Null);
    assert_eq!(single(&db, "SELECT 1 + 0.5"), Value::Real(1.5));
    assert_eq!(single(&db, "SELECT 'a' || 'b' || 3"), text("ab3"));
}

#[test]
fn test_case_expressions() {
    let db = db();
    assert_eq!(
        single(&db, "SELECT CASE WHEN 1 > 2 THEN 'x' ELSE 'y' END"),
        text("y")
    );
    assert_eq!(
        single(&db, "SELECT CASE 2 WHEN 1 THEN 'one' WHEN 2 THEN 'two' END"),
        text("two")
    );
    assert_eq!(single(&db, "SELECT CASE 9 WHEN 1 THEN 'one' END"), Value::Null);
}

#[test]
fn test_like_patterns() {
    let db = db();
    assert_eq!(single(&db, "SELECT 'hello' LIKE 'h%'"), int(1));
    assert_eq!(single(&db, "SELECT 'hello' LIKE 'H_LLO'"), int(1));
    assert_eq!(single(&db, "SELECT 'hello' NOT LIKE '%z%'"), int(1));
    assert_eq!(single(&db, "SELECT '50%' LIKE '50x%' ESCAPE 'x'"), int(1));
    assert_eq!(single(&db, "SELECT NULL LIKE '%'"), Value::Null);
}

#[test]
fn test_in_and_between() {
    let db = db();
    assert_eq!(single(&db, "SELECT 2 IN (1, 2, 3)"), int(1));
    assert_eq!(single(&db, "SELECT 5 NOT IN (1, 2, 3)"), int(1));
    assert_eq!(single(&db, "SELECT NULL IN (1, 2)"), Value::Null);
    assert_eq!(single(&db, "SELECT 2 IN (1, NULL)"), Value::Null);
    assert_eq!(single(&db, "SELECT 5 BETWEEN 1 AND 10"), int(1));
}

#[test]
fn test_cast_and_collate() {
    let db = db();
    assert_eq!(single(&db, "SELECT CAST('41' AS INTEGER) + 1"), int(42));
    assert_eq!(single(&db, "SELECT CAST(3.7 AS INTEGER)"), int(3));
    assert_eq!(single(&db, "SELECT 'ABC' = 'abc'"), int(0));
    assert_eq!(single(&db, "SELECT 'ABC' = 'abc' COLLATE NOCASE"), int(1));
}

#[test]
fn test_scalar_functions() {
    let db = db();
    assert_eq!(single(&db, "SELECT length('héllo')"), int(5));
    assert_eq!(single(&db, "SELECT coalesce(NULL, NULL, 9)"), int(9));
    assert_eq!(single(&db, "SELECT substr('hello', 2, 3)"), text("ell"));
    let err = db.eval("SELECT no_such_fn(1)", ()).expect_err("unknown fn");
    assert_eq!(err.code, StatusCode::NotFound);
}

// ============================================================================
// Query shapes
// ============================================================================

fn orders_db() -> Database {
    let db = db();
    db.exec(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT); \
         CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER, total REAL); \
         INSERT INTO users VALUES (1,'ada'),(2,'grace'),(3,'alan'); \
         INSERT INTO orders VALUES (10,1,5.0),(11,1,7.5),(12,2,3.0);",
        (),
    )
    .expect("seed");
    db
}

#[test]
fn test_inner_join() {
    let db = orders_db();
    let rows = values(
        &db,
        "SELECT u.name, o.total FROM users u JOIN orders o ON o.user_id = u.id \
         ORDER BY o.id",
    );
    assert_eq!(
        rows,
        vec![
            vec![text("ada"), Value::Real(5.0)],
            vec![text("ada"), Value::Real(7.5)],
            vec![text("grace"), Value::Real(3.0)],
        ]
    );
}

#[test]
fn test_left_join_pads_with_nulls() {
    let db = orders_db();
    let rows = values(
        &db,
        "SELECT u.name, o.id FROM users u LEFT JOIN orders o ON o.user_id = u.id \
         WHERE o.id IS NULL",
    );
    assert_eq!(rows, vec![vec![text("alan"), Value::Null]]);
}

#[test]
fn test_group_by_having() {
    let db = orders_db();
    let rows = values(
        &db,
        "SELECT user_id, count(*), sum(total) FROM orders \
         GROUP BY user_id HAVING count(*) > 1",
    );
    assert_eq!(rows, vec![vec![int(1), int(2), Value::Real(12.5)]]);
}

#[test]
fn test_aggregate_without_group_by_yields_one_row() {
    let db = db_with_t();
    assert_eq!(single(&db, "SELECT count(*) FROM t"), int(0));
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b')", ()).expect("seed");
    assert_eq!(single(&db, "SELECT count(*) FROM t"), int(2));
    assert_eq!(single(&db, "SELECT sum(id) FROM t"), int(3));
    assert_eq!(single(&db, "SELECT min(name) FROM t"), text("a"));
    // Aggregates over the empty set
    db.exec("DELETE FROM t WHERE 1", ()).expect("clear");
    assert_eq!(single(&db, "SELECT sum(id) FROM t"), Value::Null);
    assert_eq!(single(&db, "SELECT avg(id) FROM t"), Value::Null);
}

#[test]
fn test_distinct_and_count_distinct() {
    let db = orders_db();
    let rows = values(&db, "SELECT DISTINCT user_id FROM orders ORDER BY user_id");
    assert_eq!(rows, vec![vec![int(1)], vec![int(2)]]);
    assert_eq!(single(&db, "SELECT count(DISTINCT user_id) FROM orders"), int(2));
}

#[test]
fn test_order_by_forms() {
    let db = orders_db();
    // Ordinal, alias, and unprojected source column
    let by_ordinal = values(&db, "SELECT name FROM users ORDER BY 1 DESC");
    assert_eq!(
        by_ordinal,
        vec![vec![text("grace")], vec![text("alan")], vec![text("ada")]]
    );
    let by_alias = values(&db, "SELECT name AS n FROM users ORDER BY n");
    assert_eq!(by_alias[0], vec![text("ada")]);
    let hidden = values(&db, "SELECT name FROM users ORDER BY id DESC");
    assert_eq!(hidden[0], vec![text("alan")]);
}

#[test]
fn test_limit_offset() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b'),(3,'c'),(4,'d')", ())
        .expect("seed");
    let rows = values(&db, "SELECT id FROM t ORDER BY id LIMIT 2 OFFSET 1");
    assert_eq!(rows, vec![vec![int(2)], vec![int(3)]]);
    // LIMIT/OFFSET prefix monotonicity
    let small = values(&db, "SELECT id FROM t ORDER BY id LIMIT 2 OFFSET 1");
    let large = values(&db, "SELECT id FROM t ORDER BY id LIMIT 3 OFFSET 1");
    assert_eq!(&large[..small.len()], &small[..]);
}

#[test]
fn test_union_all_and_values() {
    let db = db();
    let rows = values(&db, "SELECT 1 UNION ALL SELECT 2 UNION ALL SELECT 1");
    assert_eq!(rows, vec![vec![int(1)], vec![int(2)], vec![int(1)]]);
    let rows = values(&db, "VALUES (1, 'x'), (2, 'y')");
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_subqueries() {
    let db = orders_db();
    assert_eq!(
        single(
            &db,
            "SELECT name FROM users WHERE id = (SELECT user_id FROM orders WHERE id = 12)"
        ),
        text("grace")
    );
    let rows = values(
        &db,
        "SELECT name FROM users u WHERE EXISTS \
         (SELECT 1 FROM orders o WHERE o.user_id = u.id) ORDER BY name",
    );
    assert_eq!(rows, vec![vec![text("ada")], vec![text("grace")]]);
    let rows = values(
        &db,
        "SELECT name FROM users WHERE id IN (SELECT user_id FROM orders) ORDER BY id",
    );
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_correlated_scalar_subquery() {
    let db = orders_db();
    let rows = values(
        &db,
        "SELECT name, (SELECT count(*) FROM orders o WHERE o.user_id = u.id) \
         FROM users u ORDER BY u.id",
    );
    assert_eq!(
        rows,
        vec![
            vec![text("ada"), int(2)],
            vec![text("grace"), int(1)],
            vec![text("alan"), int(0)],
        ]
    );
}

#[test]
fn test_from_subquery() {
    let db = orders_db();
    let rows = values(
        &db,
        "SELECT n FROM (SELECT count(*) AS n FROM orders) sub",
    );
    assert_eq!(rows, vec![vec![int(3)]]);
}

#[test]
fn test_with_clause() {
    let db = orders_db();
    let rows = values(
        &db,
        "WITH big(uid) AS (SELECT user_id FROM orders WHERE total > 4) \
         SELECT DISTINCT name FROM users JOIN big ON big.uid = users.id",
    );
    assert_eq!(rows, vec![vec![text("ada")]]);
    // Materialization hint is accepted
    let rows = values(
        &db,
        "WITH m AS MATERIALIZED (SELECT id FROM users) SELECT count(*) FROM m",
    );
    assert_eq!(rows, vec![vec![int(3)]]);
}

#[test]
fn test_views() {
    let db = orders_db();
    db.exec(
        "CREATE VIEW spenders (who, orders_placed) AS \
         SELECT name, (SELECT count(*) FROM orders o WHERE o.user_id = u.id) FROM users u",
        (),
    )
    .expect("create view");
    let rows = values(&db, "SELECT who FROM spenders WHERE orders_placed = 2");
    assert_eq!(rows, vec![vec![text("ada")]]);
    db.exec("DROP VIEW spenders", ()).expect("drop view");
    assert_eq!(
        db.eval("SELECT * FROM spenders", ())
            .expect_err("view gone")
            .code,
        StatusCode::NotFound
    );
}

#[test]
fn test_window_row_number() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (5,'e'),(6,'f'),(7,'g')", ())
        .expect("seed");
    let rows = values(&db, "SELECT row_number() OVER (), id FROM t");
    assert_eq!(
        rows,
        vec![
            vec![int(1), int(5)],
            vec![int(2), int(6)],
            vec![int(3), int(7)],
        ]
    );
}

#[test]
fn test_projection_idempotence() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b')", ()).expect("seed");
    let once = values(&db, "SELECT id, name FROM t");
    let twice = values(&db, "SELECT id, name FROM (SELECT id, name FROM t) s");
    assert_eq!(once, twice);
}

// ============================================================================
// Parameters
// ============================================================================

#[test]
fn test_positional_parameters() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (?, ?)", vec![int(1), text("a")])
        .expect("insert");
    let rows: Vec<Row> = db
        .eval("SELECT name FROM t WHERE id = ?", vec![int(1)])
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    assert_eq!(rows[0].get(0), Some(&text("a")));
}

#[test]
fn test_named_parameters() {
    let db = db_with_t();
    db.exec(
        "INSERT INTO t VALUES (:id, @name)",
        vec![("id", int(7)), ("name", text("zed"))],
    )
    .expect("insert");
    let rows: Vec<Row> = db
        .eval("SELECT name FROM t WHERE id = $id", vec![("id", int(7))])
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    assert_eq!(rows[0].get(0), Some(&text("zed")));
}

#[test]
fn test_missing_parameter_is_misuse() {
    let db = db_with_t();
    let err = db
        .eval("SELECT * FROM t WHERE id = ?", ())
        .expect_err("unbound");
    assert_eq!(err.code, StatusCode::Misuse);
}

// ============================================================================
// Prepared statements
// ============================================================================

#[test]
fn test_prepared_statement_reuse() {
    let db = db_with_t();
    let mut insert = db.prepare("INSERT INTO t VALUES (?, ?)").expect("prepare");
    for i in 1..=3 {
        insert
            .bind(vec![int(i), text(&format!("row{i}"))])
            .run()
            .expect("run");
    }
    let mut select = db
        .prepare("SELECT name FROM t WHERE id = ?")
        .expect("prepare select");
    let rows = select.bind(vec![int(2)]).all().expect("all");
    assert_eq!(rows[0].get(0), Some(&text("row2")));
}

#[test]
fn test_prepare_rejects_programs() {
    let db = db_with_t();
    let err = db
        .prepare("SELECT 1; SELECT 2;")
        .expect_err("multi-statement");
    assert_eq!(err.code, StatusCode::Misuse);
}

// ============================================================================
// Options / pragmas
// ============================================================================

#[test]
fn test_pragma_unknown_write_ignored_read_errors() {
    let db = db();
    db.exec("PRAGMA totally_unknown = 42", ()).expect("ignored");
    let err = db.eval("PRAGMA totally_unknown", ()).expect_err("read");
    assert_eq!(err.code, StatusCode::Misuse);

    db.exec("PRAGMA statement_timeout_ms = 1000", ()).expect("write");
    assert_eq!(single(&db, "PRAGMA statement_timeout_ms"), int(1000));
    assert_eq!(db.get_option("statement_timeout_ms").expect("opt"), int(1000));
}

#[test]
fn test_analyze_refreshes_estimates() {
    let db = db_with_t();
    db.exec("INSERT INTO t VALUES (1,'a'),(2,'b')", ()).expect("seed");
    db.exec("ANALYZE t", ()).expect("analyze");
    let schema = db.session().schema.read().require_table("t").expect("schema");
    assert_eq!(schema.estimated_rows(), 2);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_unknown_column_has_location() {
    let db = db_with_t();
    let err = db.eval("SELECT missing FROM t", ()).expect_err("unknown");
    assert_eq!(err.code, StatusCode::NotFound);
    assert!(err.location.is_some());
}

#[test]
fn test_ambiguous_column() {
    let db = orders_db();
    let err = db
        .eval("SELECT id FROM users u JOIN orders o ON o.user_id = u.id", ())
        .expect_err("ambiguous");
    assert_eq!(err.code, StatusCode::Ambiguous);
}

#[test]
fn test_syntax_error_surface() {
    let db = db();
    let err = db.eval("SELEC 1", ()).expect_err("syntax");
    assert_eq!(err.code, StatusCode::Syntax);
}

#[test]
fn test_aggregate_in_where_is_misuse() {
    let db = db_with_t();
    let err = db
        .eval("SELECT * FROM t WHERE count(*) > 1", ())
        .expect_err("misuse");
    assert_eq!(err.code, StatusCode::Misuse);
}

#[test]
fn test_empty_program_is_ok() {
    let db = db();
    db.exec("", ()).expect("empty");
    db.exec(" ;; ", ()).expect("semicolons");
    assert_eq!(all(&db, "").len(), 0);
}

#[test]
fn test_multi_statement_program_returns_last_select() {
    let db = db();
    let rows = values(
        &db,
        "CREATE TABLE m (id INTEGER PRIMARY KEY); \
         INSERT INTO m VALUES (1), (2); \
         SELECT count(*) FROM m;",
    );
    assert_eq!(rows, vec![vec![int(2)]]);
}

#[test]
fn test_bound_params_apply_across_program() {
    let db = db_with_t();
    db.exec(
        "INSERT INTO t VALUES (?, ?); INSERT INTO t VALUES (?, ?);",
        Params::positional(vec![int(1), text("a"), int(2), text("b")]),
    )
    .expect("program with params");
    assert_eq!(single(&db, "SELECT count(*) FROM t"), int(2));
}

#[test]
fn test_block_program_over_existing_tables() {
    use quereus::exec::{emit::emit_program, Interrupt, RuntimeContext};

    let db = db_with_t();
    let statements = quereus::parser::parse_program(
        "INSERT INTO t VALUES (1, 'a'); INSERT INTO t VALUES (2, 'b'); \
         SELECT count(*) FROM t;",
    )
    .expect("parse");
    let plan = quereus::planner::Planner::new(db.session())
        .build_program(&statements)
        .expect("plan block");
    assert!(plan.explain().starts_with("Block"));

    let program = emit_program(&plan, db.session()).expect("emit");
    let ctx = RuntimeContext::new(
        std::rc::Rc::clone(db.session()),
        Params::new(),
        Interrupt::none(),
    );
    let rows = match program.run(&ctx).expect("run") {
        quereus::exec::Output::Rows(rows) => rows.collect::<Result<Vec<_>>>().expect("rows"),
        _ => panic!("block should yield the last statement's rows"),
    };
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&int(2)));
}

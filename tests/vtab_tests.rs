//! Virtual-Table Contract Tests
//!
//! A host-defined module exercises the boundary end to end: xConnect
//! binding, best_index negotiation, filter arguments arriving at
//! query, supports/execute_plan push-down, and read-only enforcement.

use parking_lot::Mutex;
use quereus::plan::{ConstraintOp, RelationalPlan};
use quereus::vtab::{
    FilterInfo, IndexConstraint, IndexInfo, RowIter, VirtualTable, VirtualTableConnection,
    VirtualTableModule,
};
use quereus::{
    Database, IndexSchema, QuereusError, Result, Row, StatusCode, TableSchema, Value,
};
use std::any::Any;
use std::sync::Arc;

// ============================================================================
// A canned read-only module that records every contract call
// ============================================================================

#[derive(Default)]
struct CallLog {
    best_index_offers: Mutex<Vec<usize>>,
    filters: Mutex<Vec<FilterInfo>>,
    plans_executed: Mutex<usize>,
}

struct CannedModule {
    rows: Vec<Vec<Value>>,
    log: Arc<CallLog>,
}

struct CannedTable {
    schema: Arc<TableSchema>,
    rows: Vec<Vec<Value>>,
    log: Arc<CallLog>,
}

struct CannedConnection {
    id: uuid::Uuid,
    table: String,
}

/// Push-down context: literal limit accepted by `supports`
struct CannedLimit(i64);

impl VirtualTableModule for CannedModule {
    fn create(
        &self,
        schema: &Arc<TableSchema>,
        _indexes: &[Arc<IndexSchema>],
    ) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(CannedTable {
            schema: Arc::clone(schema),
            rows: self.rows.clone(),
            log: Arc::clone(&self.log),
        }))
    }

    fn connect(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        self.create(schema, &[])
    }

    fn best_index(
        &self,
        _table: &TableSchema,
        _indexes: &[Arc<IndexSchema>],
        info: &mut IndexInfo,
    ) -> Result<()> {
        self.log.best_index_offers.lock().push(info.constraints.len());
        // Consume every usable equality on column 0
        let mut argv = 0;
        for (position, constraint) in info.constraints.iter().enumerate() {
            if constraint.usable && constraint.column == 0 && constraint.op == ConstraintOp::Eq {
                info.constraint_usage[position].argv_index = Some(argv);
                info.constraint_usage[position].omit = true;
                argv += 1;
            }
        }
        info.estimated_cost = if argv > 0 { 1.0 } else { 100.0 };
        info.estimated_rows = if argv > 0 { 1 } else { 100 };
        Ok(())
    }

    fn supports(&self, plan: &Arc<RelationalPlan>) -> Option<Arc<dyn Any + Send + Sync>> {
        let RelationalPlan::LimitOffset(limit) = plan.as_ref() else {
            return None;
        };
        let RelationalPlan::Retrieve(_) = limit.source.as_ref() else {
            return None;
        };
        match &limit.limit {
            Some(quereus::plan::ScalarPlan::Literal { value }) => {
                value.as_integer().map(|n| {
                    Arc::new(CannedLimit(n)) as Arc<dyn Any + Send + Sync>
                })
            }
            _ => None,
        }
    }

    fn destroy(&self, _schema: &TableSchema) -> Result<()> {
        Ok(())
    }
}

impl VirtualTable for CannedTable {
    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    fn query(
        &self,
        _conn: Option<&dyn VirtualTableConnection>,
        filter: FilterInfo,
    ) -> Result<RowIter> {
        self.log.filters.lock().push(filter.clone());
        let mut rows = self.rows.clone();
        // Honor consumed equality constraints on column 0
        for arg in &filter.args {
            if arg.op == ConstraintOp::Eq {
                rows.retain(|row| row.get(arg.column) == Some(&arg.value));
            }
        }
        Ok(Box::new(rows.into_iter().map(|values| Ok(Row::new(values)))))
    }

    fn update(
        &self,
        _conn: Option<&dyn VirtualTableConnection>,
        _op: quereus::plan::MutationOp,
        _new_row: Option<&[Value]>,
        _key_values: Option<&[Value]>,
    ) -> Result<Option<i64>> {
        Err(QuereusError::new(
            StatusCode::ReadOnly,
            "canned tables are read-only",
        ))
    }

    fn execute_plan(
        &self,
        _conn: Option<&dyn VirtualTableConnection>,
        _plan: &Arc<RelationalPlan>,
        ctx: &Arc<dyn Any + Send + Sync>,
    ) -> Result<RowIter> {
        *self.log.plans_executed.lock() += 1;
        let limit = ctx
            .downcast_ref::<CannedLimit>()
            .ok_or_else(|| QuereusError::internal("foreign push-down context"))?
            .0
            .max(0) as usize;
        let rows = self.rows.clone();
        Ok(Box::new(
            rows.into_iter().take(limit).map(|values| Ok(Row::new(values))),
        ))
    }

    fn open_connection(self: Arc<Self>) -> Result<Box<dyn VirtualTableConnection>> {
        Ok(Box::new(CannedConnection {
            id: uuid::Uuid::new_v4(),
            table: self.schema.name.clone(),
        }))
    }
}

impl VirtualTableConnection for CannedConnection {
    fn connection_id(&self) -> uuid::Uuid {
        self.id
    }

    fn table_name(&self) -> &str {
        &self.table
    }

    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn create_savepoint(&self, _index: u32) -> Result<()> {
        Ok(())
    }

    fn release_savepoint(&self, _index: u32) -> Result<()> {
        Ok(())
    }

    fn rollback_to_savepoint(&self, _index: u32) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

fn canned_db() -> (Database, Arc<CallLog>) {
    let log = Arc::new(CallLog::default());
    let db = Database::new().expect("open");
    db.register_module(
        "canned",
        Arc::new(CannedModule {
            rows: vec![
                vec![Value::Integer(1), Value::Text("one".into())],
                vec![Value::Integer(2), Value::Text("two".into())],
                vec![Value::Integer(3), Value::Text("three".into())],
            ],
            log: Arc::clone(&log),
        }),
    );
    db.exec(
        "CREATE TABLE c (id INTEGER PRIMARY KEY, word TEXT) USING canned",
        (),
    )
    .expect("create canned table");
    (db, log)
}

fn words(db: &Database, sql: &str) -> Vec<String> {
    db.eval(sql, ())
        .expect("eval")
        .map(|r| match r.expect("row").get(0) {
            Some(Value::Text(s)) => s.clone(),
            other => panic!("expected text, got {other:?}"),
        })
        .collect()
}

// ============================================================================
// Contract behavior
// ============================================================================

#[test]
fn test_scan_through_custom_module() {
    let (db, _log) = canned_db();
    assert_eq!(words(&db, "SELECT word FROM c"), vec!["one", "two", "three"]);
}

#[test]
fn test_best_index_consumed_constraint_reaches_query() {
    let (db, log) = canned_db();
    assert_eq!(words(&db, "SELECT word FROM c WHERE id = 2"), vec!["two"]);
    assert!(log.best_index_offers.lock().iter().any(|&n| n >= 1));
    let filters = log.filters.lock();
    let filtered = filters
        .iter()
        .find(|f| !f.args.is_empty())
        .expect("a filtered scan reached the module");
    assert_eq!(filtered.args[0].column, 0);
    assert_eq!(filtered.args[0].value, Value::Integer(2));
}

#[test]
fn test_unconsumed_predicates_stay_in_engine() {
    let (db, _log) = canned_db();
    // The module only consumes id equality; the word predicate runs in
    // the engine's Filter node
    assert_eq!(
        words(&db, "SELECT word FROM c WHERE word LIKE 't%'"),
        vec!["two", "three"]
    );
}

#[test]
fn test_limit_pushdown_executes_in_module() {
    let (db, log) = canned_db();
    let rows: Vec<Row> = db
        .eval("SELECT * FROM c LIMIT 2", ())
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(*log.plans_executed.lock(), 1);
}

#[test]
fn test_writes_to_readonly_module_fail() {
    let (db, _log) = canned_db();
    let err = db
        .exec("INSERT INTO c VALUES (4, 'four')", ())
        .expect_err("read-only");
    assert_eq!(err.code, StatusCode::ReadOnly);
    assert!(err.message.contains('c'));
}

#[test]
fn test_unknown_module_fails_at_build() {
    let db = Database::new().expect("open");
    let err = db
        .exec("CREATE TABLE x (id INTEGER PRIMARY KEY) USING nonexistent", ())
        .expect_err("unknown module");
    assert_eq!(err.code, StatusCode::NotFound);
}

// ============================================================================
// Secondary index access paths (memory module)
// ============================================================================

#[test]
fn test_create_index_and_indexed_scan() {
    let db = Database::new().expect("open");
    db.exec(
        "CREATE TABLE people (id INTEGER PRIMARY KEY, city TEXT, age INTEGER); \
         INSERT INTO people VALUES (1,'oslo',30),(2,'lima',40),(3,'oslo',50),(4,'pune',25); \
         CREATE INDEX people_city ON people (city);",
        (),
    )
    .expect("seed");

    // The planner should choose the secondary index for a city lookup
    let stmt = quereus::parser::parse_statement("SELECT id FROM people WHERE city = 'oslo'")
        .expect("parse");
    let plan = quereus::planner::Planner::new(db.session())
        .build_statement(&stmt)
        .expect("plan");
    assert!(
        plan.explain().contains("index people_city"),
        "plan did not choose the index:\n{}",
        plan.explain()
    );

    let rows: Vec<Row> = db
        .eval("SELECT id FROM people WHERE city = 'oslo'", ())
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    let ids: Vec<&Value> = rows.iter().filter_map(|r| r.get(0)).collect();
    assert_eq!(ids, vec![&Value::Integer(1), &Value::Integer(3)]);
}

#[test]
fn test_index_sees_uncommitted_writes() {
    let db = Database::new().expect("open");
    db.exec(
        "CREATE TABLE p (id INTEGER PRIMARY KEY, city TEXT); \
         CREATE INDEX p_city ON p (city); \
         INSERT INTO p VALUES (1, 'oslo');",
        (),
    )
    .expect("seed");
    db.exec("BEGIN", ()).expect("begin");
    db.exec("INSERT INTO p VALUES (2, 'oslo')", ()).expect("insert");
    let rows: Vec<Row> = db
        .eval("SELECT id FROM p WHERE city = 'oslo'", ())
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    assert_eq!(rows.len(), 2);
    db.exec("ROLLBACK", ()).expect("rollback");
    let rows: Vec<Row> = db
        .eval("SELECT id FROM p WHERE city = 'oslo'", ())
        .expect("eval")
        .collect::<Result<_>>()
        .expect("rows");
    assert_eq!(rows.len(), 1);
}

#[test]
fn test_pk_order_consumed_skips_sort() {
    let db = Database::new().expect("open");
    db.exec("CREATE TABLE s (id INTEGER PRIMARY KEY, v TEXT)", ())
        .expect("create");
    let stmt =
        quereus::parser::parse_statement("SELECT * FROM s ORDER BY id").expect("parse");
    let plan = quereus::planner::Planner::new(db.session())
        .build_statement(&stmt)
        .expect("plan");
    assert!(
        !plan.explain().contains("Sort"),
        "pk-ordered scan still sorts:\n{}",
        plan.explain()
    );
}

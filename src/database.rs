//! # Public Database API
//!
//! The host-facing surface: open a handle, execute or evaluate SQL,
//! prepare reusable statements, register modules and functions, and
//! subscribe to committed change events.
//!
//! ```rust
//! use quereus::{Database, Value};
//!
//! let db = Database::new().unwrap();
//! db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ()).unwrap();
//! db.exec("INSERT INTO t VALUES (1, 'a'), (2, 'b')", ()).unwrap();
//! let names: Vec<_> = db
//!     .eval("SELECT name FROM t ORDER BY id", ())
//!     .unwrap()
//!     .map(|r| r.unwrap().get(0).cloned().unwrap())
//!     .collect();
//! assert_eq!(names, vec![Value::Text("a".into()), Value::Text("b".into())]);
//! ```

use crate::config::Config;
use crate::error::Result;
use crate::events::DataChange;
use crate::exec::{emit::emit_program, finish_statement, Interrupt, Output, Params, RuntimeContext, Scheduler};
use crate::parser::parse_program;
use crate::planner::Planner;
use crate::schema::FunctionSchema;
use crate::session::Session;
use crate::value::{Row, Value};
use crate::vtab::{RowIter, VirtualTableModule};
use crossbeam_channel::Receiver;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::debug;

/// Result-row stream returned by [`Database::eval`] and
/// [`Statement::iterate`]
pub struct Rows {
    inner: RowIter,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows").finish_non_exhaustive()
    }
}

impl Rows {
    pub(crate) fn new(inner: RowIter) -> Self {
        Rows { inner }
    }

    pub fn empty() -> Self {
        Rows {
            inner: Box::new(std::iter::empty()),
        }
    }
}

impl Iterator for Rows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// An embeddable database handle. Single-threaded: one statement at a
/// time; concurrent statements on one handle are not supported.
pub struct Database {
    session: Rc<Session>,
    interrupt_flag: Arc<AtomicBool>,
    last_changes: Cell<i64>,
}

impl Database {
    /// Open a handle with default configuration
    pub fn new() -> Result<Self> {
        Ok(Database::with_config(&Config::default()))
    }

    /// Open a handle with explicit configuration
    pub fn with_config(config: &Config) -> Self {
        Database {
            session: Rc::new(Session::new(config)),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            last_changes: Cell::new(0),
        }
    }

    /// Close the handle: roll back open work, release connections
    pub fn close(self) -> Result<()> {
        self.session.close()
    }

    fn runtime_context(&self, params: Params) -> Rc<RuntimeContext> {
        let interrupt = Interrupt::with_flag(
            Arc::clone(&self.interrupt_flag),
            self.session.statement_timeout(),
        );
        RuntimeContext::new(Rc::clone(&self.session), params, interrupt)
    }

    /// Plan, emit, and run statements one at a time so later statements
    /// see the catalog effects of earlier DDL. The final statement's
    /// rows stream; earlier row-producing statements are drained.
    fn run_program(&self, sql: &str, params: Params) -> Result<Output> {
        let statements = parse_program(sql)?;
        if statements.is_empty() {
            return Ok(Output::Nothing);
        }
        let ctx = self.runtime_context(params);
        let total = statements.len();
        let mut last_rows: Option<Vec<Row>> = None;
        for (position, statement) in statements.iter().enumerate() {
            let plan = Planner::new(&self.session).build_statement(statement)?;
            debug!(plan = %plan.explain(), "statement planned");
            let program = emit_program(&plan, &self.session)?;
            let result = program.run(&ctx);
            let output = finish_statement(&ctx, result)?;
            match output {
                Output::Rows(rows) => {
                    if position + 1 == total {
                        self.last_changes.set(ctx.changes());
                        return Ok(Output::Rows(rows));
                    }
                    last_rows = Some(rows.collect::<Result<Vec<_>>>()?);
                }
                Output::Value(value) => {
                    last_rows = Some(vec![Row::new(vec![value])]);
                }
                Output::Callback(_) | Output::Nothing => {}
            }
        }
        self.last_changes.set(ctx.changes());
        match last_rows {
            Some(rows) => Ok(Output::Rows(Box::new(rows.into_iter().map(Ok)))),
            None => Ok(Output::Nothing),
        }
    }

    /// Execute a statement program; results are discarded
    pub fn exec(&self, sql: &str, params: impl Into<Params>) -> Result<()> {
        match self.run_program(sql, params.into())? {
            Output::Rows(rows) => {
                // Drain so the whole program runs even mid-stream
                for row in rows {
                    row?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Evaluate a statement program, yielding the result rows of its
    /// last row-producing statement
    pub fn eval(&self, sql: &str, params: impl Into<Params>) -> Result<Rows> {
        match self.run_program(sql, params.into())? {
            Output::Rows(rows) => Ok(Rows::new(rows)),
            Output::Value(value) => Ok(Rows::new(Box::new(std::iter::once(Ok(Row::new(vec![
                value,
            ])))))),
            _ => Ok(Rows::empty()),
        }
    }

    /// Prepare a single statement for repeated execution. The plan and
    /// its emitted program are reused; captured schema objects are
    /// re-validated on every run, so DDL between prepare and run
    /// surfaces as `SCHEMA_CHANGED`.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let statement = crate::parser::parse_statement(sql)?;
        let plan = Planner::new(&self.session).build_statement(&statement)?;
        let program = emit_program(&plan, &self.session)?;
        Ok(Statement {
            db: DatabaseRef {
                session: Rc::clone(&self.session),
                interrupt_flag: Arc::clone(&self.interrupt_flag),
            },
            program: Rc::new(program),
            params: Params::new(),
        })
    }

    /// Rows changed by the most recent statement program
    pub fn changes(&self) -> i64 {
        self.last_changes.get()
    }

    /// Register a virtual-table module under a name
    pub fn register_module(&self, name: &str, module: Arc<dyn VirtualTableModule>) {
        self.session.register_module(name, module);
    }

    /// Register (or replace) a scalar function
    pub fn register_function(&self, function: FunctionSchema) {
        self.session.schema.write().register_function(function);
    }

    /// Set a handle option; unknown names are silently ignored
    pub fn set_option(&self, name: &str, value: Value) {
        self.session.set_option(name, value);
    }

    /// Read a handle option; unknown names raise `MISUSE`
    pub fn get_option(&self, name: &str) -> Result<Value> {
        self.session.get_option(name)
    }

    /// Subscribe to post-commit data-change events
    pub fn on_data_change(&self) -> Receiver<DataChange> {
        self.session.bus.subscribe()
    }

    /// Cancellation handle shared by every statement on this handle;
    /// usable from other threads
    pub fn interrupt_handle(&self) -> Interrupt {
        Interrupt::with_flag(Arc::clone(&self.interrupt_flag), None)
    }

    /// Whether an explicit transaction is open
    pub fn is_in_transaction(&self) -> bool {
        self.session.txn.borrow().is_in_transaction()
    }

    #[doc(hidden)]
    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }
}

/// Shared pieces a prepared statement keeps alive
struct DatabaseRef {
    session: Rc<Session>,
    interrupt_flag: Arc<AtomicBool>,
}

/// A prepared statement: plan and emitted program, reusable with fresh
/// bindings
pub struct Statement {
    db: DatabaseRef,
    program: Rc<Scheduler>,
    params: Params,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement").finish_non_exhaustive()
    }
}

impl Statement {
    /// Bind parameters for the next execution
    pub fn bind(&mut self, params: impl Into<Params>) -> &mut Self {
        self.params = params.into();
        self
    }

    fn execute(&self) -> Result<Output> {
        let interrupt = Interrupt::with_flag(
            Arc::clone(&self.db.interrupt_flag),
            self.db.session.statement_timeout(),
        );
        let ctx = RuntimeContext::new(
            Rc::clone(&self.db.session),
            self.params.clone(),
            interrupt,
        );
        let result = self.program.run(&ctx);
        finish_statement(&ctx, result)
    }

    /// Execute, discarding any rows
    pub fn run(&mut self) -> Result<()> {
        match self.execute()? {
            Output::Rows(rows) => {
                for row in rows {
                    row?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Execute and collect every result row
    pub fn all(&mut self) -> Result<Vec<Row>> {
        match self.execute()? {
            Output::Rows(rows) => rows.collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Execute and stream result rows
    pub fn iterate(&mut self) -> Result<Rows> {
        match self.execute()? {
            Output::Rows(rows) => Ok(Rows::new(rows)),
            _ => Ok(Rows::empty()),
        }
    }
}

/// Convenience conversions for parameter binding
impl From<Vec<(String, Value)>> for Params {
    fn from(named: Vec<(String, Value)>) -> Self {
        Params::named(named)
    }
}

impl From<Vec<(&str, Value)>> for Params {
    fn from(named: Vec<(&str, Value)>) -> Self {
        Params::named(named.into_iter().map(|(k, v)| (k.to_string(), v)))
    }
}

//! # Scheduler and Runtime
//!
//! Executes the instruction graph the emitter lowers a plan into. One
//! [`Scheduler`] exists per statement; callbacks (filter predicates,
//! CASE branches, subqueries) package subgraphs as sub-schedulers that
//! run against a fresh child context per invocation.
//!
//! Execution is single-threaded and cooperative: the only suspension
//! points are `next()` calls into row streams and callback
//! invocations. Cancellation is the cooperative flag-check pattern,
//! tested at every iterator boundary. Row slots connect relational
//! producers to the scalar instructions that read their current row:
//! a consumer registers a slot for its source node, sets it per row,
//! and the slot closes when the consumer's stream is dropped.

pub mod emit;

use crate::error::{QuereusError, Result, StatusCode};
use crate::plan::PlanNodeId;
use crate::schema::{FunctionSchema, TableSchema};
use crate::session::Session;
use crate::value::{Row, Value};
use crate::vtab::RowIter;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------

/// Cooperative cancellation handle for one statement.
///
/// Shared across threads; the runtime checks it before every iterator
/// step and vtab call.
#[derive(Clone)]
pub struct Interrupt {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub fn new(timeout: Option<Duration>) -> Self {
        Interrupt {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A handle with no timeout
    pub fn none() -> Self {
        Interrupt::new(None)
    }

    /// A per-statement handle over a long-lived cancellation flag
    pub fn with_flag(flag: Arc<AtomicBool>, timeout: Option<Duration>) -> Self {
        Interrupt {
            cancelled: flag,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Re-arm the handle after a cancellation
    pub fn clear(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `CANCELLED` once the flag is set or the deadline passed
    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(QuereusError::new(
                StatusCode::Cancelled,
                "statement cancelled",
            ));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                self.cancelled.store(true, Ordering::Relaxed);
                return Err(QuereusError::new(
                    StatusCode::Cancelled,
                    "statement timed out",
                ));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Parameters
// ----------------------------------------------------------------------

/// Bound statement parameters: 1-based positional plus named (sigils
/// already stripped by the parser)
#[derive(Debug, Clone, Default)]
pub struct Params {
    positional: Vec<Value>,
    named: HashMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    pub fn positional(values: Vec<Value>) -> Self {
        Params {
            positional: values,
            named: HashMap::new(),
        }
    }

    pub fn named(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Params {
            positional: Vec::new(),
            named: values
                .into_iter()
                .map(|(name, value)| (name.trim_start_matches([':', '@', '$']).to_string(), value))
                .collect(),
        }
    }

    pub fn get_positional(&self, index: usize) -> Result<Value> {
        self.positional
            .get(index.checked_sub(1).ok_or_else(|| {
                QuereusError::misuse("parameter indexes start at 1")
            })?)
            .cloned()
            .ok_or_else(|| QuereusError::misuse(format!("no value bound for parameter ?{index}")))
    }

    pub fn get_named(&self, name: &str) -> Result<Value> {
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| QuereusError::misuse(format!("no value bound for parameter :{name}")))
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::positional(values)
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::new()
    }
}

// ----------------------------------------------------------------------
// Runtime context and row slots
// ----------------------------------------------------------------------

/// Per-execution state: row slots, parameters, interrupt, and the
/// session the statement runs against. Sub-schedulers get child
/// contexts whose slot lookup falls through to the parent, which is
/// how correlated subqueries see outer rows.
pub struct RuntimeContext {
    pub session: Rc<Session>,
    pub params: Params,
    pub interrupt: Interrupt,
    slots: RefCell<HashMap<PlanNodeId, Row>>,
    parent: Option<Rc<RuntimeContext>>,
    /// Rows changed by the statement, shared with child contexts
    changes: Rc<Cell<i64>>,
    /// Window-function counters, shared with child contexts
    window_counters: Rc<RefCell<HashMap<u64, i64>>>,
}

impl RuntimeContext {
    pub fn new(session: Rc<Session>, params: Params, interrupt: Interrupt) -> Rc<Self> {
        Rc::new(RuntimeContext {
            session,
            params,
            interrupt,
            slots: RefCell::new(HashMap::new()),
            parent: None,
            changes: Rc::new(Cell::new(0)),
            window_counters: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    /// Fresh sub-context for a callback invocation
    pub fn child(self: &Rc<Self>) -> Rc<RuntimeContext> {
        Rc::new(RuntimeContext {
            session: Rc::clone(&self.session),
            params: self.params.clone(),
            interrupt: self.interrupt.clone(),
            slots: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(self)),
            changes: Rc::clone(&self.changes),
            window_counters: Rc::clone(&self.window_counters),
        })
    }

    pub fn check_interrupt(&self) -> Result<()> {
        self.interrupt.check()
    }

    /// Current row of a producer, walking outward through parents
    pub fn row(&self, node: PlanNodeId) -> Option<Row> {
        if let Some(row) = self.slots.borrow().get(&node) {
            return Some(row.clone());
        }
        self.parent.as_ref().and_then(|p| p.row(node))
    }

    fn set_row(&self, node: PlanNodeId, row: Row) {
        self.slots.borrow_mut().insert(node, row);
    }

    fn clear_row(&self, node: PlanNodeId) {
        self.slots.borrow_mut().remove(&node);
    }

    pub fn add_changes(&self, n: i64) {
        self.changes.set(self.changes.get() + n);
    }

    pub fn changes(&self) -> i64 {
        self.changes.get()
    }

    /// Next value of a per-statement window counter
    pub fn window_next(&self, id: u64) -> i64 {
        let mut counters = self.window_counters.borrow_mut();
        let counter = counters.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Registration of a producer's current row in a context. Dropping the
/// slot closes it (removes the entry); closing is idempotent.
pub struct RowSlot {
    ctx: Rc<RuntimeContext>,
    node: PlanNodeId,
}

impl RowSlot {
    pub fn create(ctx: &Rc<RuntimeContext>, node: PlanNodeId) -> Self {
        RowSlot {
            ctx: Rc::clone(ctx),
            node,
        }
    }

    pub fn set(&self, row: Row) {
        self.ctx.set_row(self.node, row);
    }
}

impl Drop for RowSlot {
    fn drop(&mut self) {
        self.ctx.clear_row(self.node);
    }
}

// ----------------------------------------------------------------------
// Instructions and schedulers
// ----------------------------------------------------------------------

/// A re-invocable subprogram produced by `emit_call`
pub type Callback = Rc<dyn Fn(&Rc<RuntimeContext>) -> Result<Output>>;

/// What an instruction's `run` produces
pub enum Output {
    Value(Value),
    Rows(RowIter),
    Callback(Callback),
    /// Sinks and executors produce nothing
    Nothing,
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Output::Rows(_) => f.debug_tuple("Rows").finish_non_exhaustive(),
            Output::Callback(_) => f.debug_tuple("Callback").finish_non_exhaustive(),
            Output::Nothing => write!(f, "Nothing"),
        }
    }
}

impl Output {
    pub fn into_value(self) -> Result<Value> {
        match self {
            Output::Value(value) => Ok(value),
            _ => Err(QuereusError::internal("instruction did not produce a value")),
        }
    }

    pub fn into_rows(self) -> Result<RowIter> {
        match self {
            Output::Rows(rows) => Ok(rows),
            _ => Err(QuereusError::internal("instruction did not produce rows")),
        }
    }

    pub fn into_callback(self) -> Result<Callback> {
        match self {
            Output::Callback(callback) => Ok(callback),
            _ => Err(QuereusError::internal(
                "instruction did not produce a callback",
            )),
        }
    }
}

/// Run function of one instruction: receives the resolved parameter
/// outputs and the execution context
pub type RunFn = Box<dyn Fn(&Rc<RuntimeContext>, Vec<Output>) -> Result<Output>>;

/// One node of the instruction graph
pub struct Instruction {
    pub params: Vec<Instruction>,
    pub run: RunFn,
    /// Short description for tracing
    pub note: &'static str,
}

impl Instruction {
    pub fn new(note: &'static str, params: Vec<Instruction>, run: RunFn) -> Self {
        Instruction { params, run, note }
    }

    /// Leaf instruction with no inputs
    pub fn leaf(note: &'static str, run: RunFn) -> Self {
        Instruction::new(note, Vec::new(), run)
    }
}

/// A schema object captured at emit time, validated by identity before
/// execution
pub enum CapturedObject {
    Table(Arc<TableSchema>),
    Function(Arc<FunctionSchema>),
}

/// Executes one statement's instruction graph
pub struct Scheduler {
    root: Instruction,
    captured: Vec<CapturedObject>,
}

impl Scheduler {
    pub fn new(root: Instruction, captured: Vec<CapturedObject>) -> Self {
        Scheduler { root, captured }
    }

    /// Resolve parameters depth-first, then run the root. Captured
    /// schema objects are re-validated first, so a DDL change between
    /// emission and execution fails with `SCHEMA_CHANGED` instead of a
    /// stale read.
    pub fn run(&self, ctx: &Rc<RuntimeContext>) -> Result<Output> {
        self.validate_captured(ctx)?;
        execute(&self.root, ctx)
    }

    fn validate_captured(&self, ctx: &Rc<RuntimeContext>) -> Result<()> {
        for captured in &self.captured {
            match captured {
                CapturedObject::Table(table) => {
                    let current = ctx.session.schema.read().table(&table.name);
                    let same = current.is_some_and(|c| Arc::ptr_eq(&c, table));
                    if !same {
                        return Err(QuereusError::new(
                            StatusCode::SchemaChanged,
                            format!("table '{}' changed since the statement was prepared", table.name),
                        ));
                    }
                }
                CapturedObject::Function(function) => {
                    let current = ctx
                        .session
                        .schema
                        .read()
                        .function(&function.name, function.arity.unwrap_or(0));
                    let same = current.is_some_and(|c| Arc::ptr_eq(&c, function));
                    if !same {
                        return Err(QuereusError::new(
                            StatusCode::SchemaChanged,
                            format!(
                                "function '{}' changed since the statement was prepared",
                                function.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Depth-first instruction execution
pub fn execute(instruction: &Instruction, ctx: &Rc<RuntimeContext>) -> Result<Output> {
    ctx.check_interrupt()?;
    let mut args = Vec::with_capacity(instruction.params.len());
    for param in &instruction.params {
        args.push(execute(param, ctx)?);
    }
    (instruction.run)(ctx, args)
}

/// Wrap a stream so cancellation is checked at every iterator boundary
pub fn guarded(ctx: &Rc<RuntimeContext>, mut rows: RowIter) -> RowIter {
    let ctx = Rc::clone(ctx);
    Box::new(std::iter::from_fn(move || {
        if let Err(err) = ctx.check_interrupt() {
            return Some(Err(err));
        }
        rows.next()
    }))
}

/// Commit or roll back the implicit transaction around one statement
pub fn finish_statement(ctx: &Rc<RuntimeContext>, result: Result<Output>) -> Result<Output> {
    let implicit = {
        let txn = ctx.session.txn.borrow();
        txn.is_in_transaction() && !txn.is_explicit()
    };
    if !implicit {
        return result;
    }
    match result {
        Ok(output) => {
            ctx.session.txn.borrow_mut().commit()?;
            Ok(output)
        }
        Err(err) => {
            // A failed autocommit statement leaves no partial writes
            let _ = ctx.session.txn.borrow_mut().rollback();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn context() -> Rc<RuntimeContext> {
        RuntimeContext::new(
            Rc::new(Session::new(&Config::default())),
            Params::new(),
            Interrupt::none(),
        )
    }

    fn value_instruction(v: i64) -> Instruction {
        Instruction::leaf(
            "literal",
            Box::new(move |_, _| Ok(Output::Value(Value::Integer(v)))),
        )
    }

    #[test]
    fn test_params_resolve_before_run() {
        let add = Instruction::new(
            "add",
            vec![value_instruction(2), value_instruction(3)],
            Box::new(|_, args| {
                let mut sum = 0;
                for arg in args {
                    if let Value::Integer(i) = arg.into_value()? {
                        sum += i;
                    }
                }
                Ok(Output::Value(Value::Integer(sum)))
            }),
        );
        let ctx = context();
        let out = execute(&add, &ctx).expect("execute");
        assert_eq!(out.into_value().expect("value"), Value::Integer(5));
    }

    #[test]
    fn test_row_slot_closes_on_drop() {
        let ctx = context();
        {
            let slot = RowSlot::create(&ctx, 42);
            slot.set(Row::new(vec![Value::Integer(1)]));
            assert!(ctx.row(42).is_some());
        }
        assert!(ctx.row(42).is_none());
    }

    #[test]
    fn test_child_context_reads_parent_slots() {
        let ctx = context();
        let slot = RowSlot::create(&ctx, 7);
        slot.set(Row::new(vec![Value::Integer(9)]));
        let child = ctx.child();
        assert_eq!(
            child.row(7).expect("inherited").get(0),
            Some(&Value::Integer(9))
        );
        // Child slots do not leak upward
        child.set_row(8, Row::empty());
        assert!(ctx.row(8).is_none());
    }

    #[test]
    fn test_interrupt_cancels_execution() {
        let ctx = context();
        ctx.interrupt.cancel();
        let instruction = value_instruction(1);
        let err = execute(&instruction, &ctx).expect_err("cancelled");
        assert_eq!(err.code, StatusCode::Cancelled);
    }

    #[test]
    fn test_interrupt_deadline() {
        let interrupt = Interrupt::new(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(interrupt.check().is_err());
    }

    #[test]
    fn test_named_param_sigil_stripping() {
        let params = Params::named(vec![(":who".to_string(), Value::Text("ada".into()))]);
        assert_eq!(params.get_named("who").expect("named"), Value::Text("ada".into()));
        assert!(params.get_named("missing").is_err());
    }

    #[test]
    fn test_positional_params_are_one_based() {
        let params = Params::positional(vec![Value::Integer(10)]);
        assert_eq!(params.get_positional(1).expect("first"), Value::Integer(10));
        assert!(params.get_positional(0).is_err());
        assert!(params.get_positional(2).is_err());
    }

    #[test]
    fn test_window_counter_is_shared_with_children() {
        let ctx = context();
        assert_eq!(ctx.window_next(1), 1);
        let child = ctx.child();
        assert_eq!(child.window_next(1), 2);
        assert_eq!(ctx.window_next(1), 3);
    }
}

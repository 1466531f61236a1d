//! # Emitter
//!
//! Lowers plan nodes into [`Instruction`]s. A process-wide registry,
//! populated once at startup, maps every plan-node kind to its emitter
//! function; emission walks the plan recursively through the registry.
//!
//! Emitters are pure with respect to the plan. Schema objects touched
//! during emission are captured into the [`EmitCtx`]; the scheduler
//! re-validates them by identity before executing, which turns DDL
//! churn between emit and execute into `SCHEMA_CHANGED`.
//!
//! Column references resolve at emit time through a stack of row
//! descriptors (attribute id to `(producing node, column index)`);
//! consumers push their source's descriptor while emitting the scalar
//! programs that read from it.

mod dml;
mod relational;
mod scalar;
mod sink;

use super::{CapturedObject, Instruction, Output, RuntimeContext, Scheduler};
use crate::error::{QuereusError, Result};
use crate::plan::{
    AttributeId, PlanNode, PlanNodeId, RelationalKind, RelationalPlan, ScalarKind, ScalarPlan,
    SinkKind, SinkPlan,
};
use crate::schema::{FunctionSchema, TableSchema};
use crate::session::Session;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, LazyLock};
use tracing::trace;

pub type RelationalEmitter = fn(&Arc<RelationalPlan>, &mut EmitCtx<'_>) -> Result<Instruction>;
pub type ScalarEmitter = fn(&ScalarPlan, &mut EmitCtx<'_>) -> Result<Instruction>;
pub type SinkEmitter = fn(&Arc<SinkPlan>, &mut EmitCtx<'_>) -> Result<Instruction>;

/// Process-wide emitter registry, populated once at startup
pub struct EmitterRegistry {
    relational: HashMap<RelationalKind, RelationalEmitter>,
    scalar: HashMap<ScalarKind, ScalarEmitter>,
    sink: HashMap<SinkKind, SinkEmitter>,
}

impl EmitterRegistry {
    fn standard() -> Self {
        let mut relational: HashMap<RelationalKind, RelationalEmitter> = HashMap::new();
        relational.insert(RelationalKind::SingleRow, relational::emit_single_row);
        relational.insert(RelationalKind::Values, relational::emit_values);
        relational.insert(RelationalKind::Retrieve, relational::emit_retrieve);
        relational.insert(RelationalKind::RemoteQuery, relational::emit_remote_query);
        relational.insert(RelationalKind::Project, relational::emit_project);
        relational.insert(RelationalKind::Filter, relational::emit_filter);
        relational.insert(RelationalKind::Join, relational::emit_join);
        relational.insert(RelationalKind::Aggregate, relational::emit_aggregate);
        relational.insert(RelationalKind::Sort, relational::emit_sort);
        relational.insert(RelationalKind::Distinct, relational::emit_distinct);
        relational.insert(RelationalKind::LimitOffset, relational::emit_limit_offset);
        relational.insert(RelationalKind::UnionAll, relational::emit_union_all);
        relational.insert(RelationalKind::Cte, relational::emit_cte);
        relational.insert(RelationalKind::Block, relational::emit_block);
        relational.insert(RelationalKind::Insert, dml::emit_insert);
        relational.insert(RelationalKind::Update, dml::emit_update);
        relational.insert(RelationalKind::Delete, dml::emit_delete);
        relational.insert(RelationalKind::ConstraintCheck, dml::emit_constraint_check);
        relational.insert(RelationalKind::DmlExecutor, dml::emit_dml_executor);

        let mut scalar: HashMap<ScalarKind, ScalarEmitter> = HashMap::new();
        scalar.insert(ScalarKind::Literal, scalar::emit_literal);
        scalar.insert(ScalarKind::ColumnRef, scalar::emit_column_ref);
        scalar.insert(ScalarKind::Parameter, scalar::emit_parameter);
        scalar.insert(ScalarKind::Unary, scalar::emit_unary);
        scalar.insert(ScalarKind::Binary, scalar::emit_binary);
        scalar.insert(ScalarKind::FunctionCall, scalar::emit_function_call);
        scalar.insert(ScalarKind::WindowCall, scalar::emit_window_call);
        scalar.insert(ScalarKind::Case, scalar::emit_case);
        scalar.insert(ScalarKind::Cast, scalar::emit_cast);
        scalar.insert(ScalarKind::Collate, scalar::emit_collate);
        scalar.insert(ScalarKind::IsNull, scalar::emit_is_null);
        scalar.insert(ScalarKind::Like, scalar::emit_like);
        scalar.insert(ScalarKind::InList, scalar::emit_in_list);
        scalar.insert(ScalarKind::InSubquery, scalar::emit_in_subquery);
        scalar.insert(ScalarKind::Exists, scalar::emit_exists);
        scalar.insert(ScalarKind::ScalarSubquery, scalar::emit_scalar_subquery);

        let mut sink: HashMap<SinkKind, SinkEmitter> = HashMap::new();
        sink.insert(SinkKind::CreateTable, sink::emit_create_table);
        sink.insert(SinkKind::DropTable, sink::emit_drop_table);
        sink.insert(SinkKind::CreateIndex, sink::emit_create_index);
        sink.insert(SinkKind::DropIndex, sink::emit_drop_index);
        sink.insert(SinkKind::CreateView, sink::emit_create_view);
        sink.insert(SinkKind::DropView, sink::emit_drop_view);
        sink.insert(SinkKind::Begin, sink::emit_begin);
        sink.insert(SinkKind::Commit, sink::emit_commit);
        sink.insert(SinkKind::Rollback, sink::emit_rollback);
        sink.insert(SinkKind::Savepoint, sink::emit_savepoint);
        sink.insert(SinkKind::Release, sink::emit_release);
        sink.insert(SinkKind::Pragma, sink::emit_pragma);
        sink.insert(SinkKind::Analyze, sink::emit_analyze);

        EmitterRegistry {
            relational,
            scalar,
            sink,
        }
    }
}

static REGISTRY: LazyLock<EmitterRegistry> = LazyLock::new(EmitterRegistry::standard);

/// Emission state: captured schema objects plus the row-descriptor
/// stack for column resolution
pub struct EmitCtx<'s> {
    session: &'s Session,
    captured: Vec<CapturedObject>,
    resolver: Vec<HashMap<AttributeId, (PlanNodeId, usize)>>,
}

impl<'s> EmitCtx<'s> {
    pub fn new(session: &'s Session) -> Self {
        EmitCtx {
            session,
            captured: Vec::new(),
            resolver: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    /// Push the row descriptor of a producer: its attributes become
    /// resolvable to `(node id, column index)`
    pub fn push_descriptor(&mut self, node: &RelationalPlan) {
        let descriptor = node
            .attributes()
            .iter()
            .enumerate()
            .map(|(index, attr)| (attr.id, (node.id(), index)))
            .collect();
        self.resolver.push(descriptor);
    }

    pub fn pop_descriptor(&mut self) {
        self.resolver.pop();
    }

    /// Resolve an attribute id against the descriptor stack, innermost
    /// first (outer frames serve correlated subqueries)
    pub fn resolve_attribute(&self, id: AttributeId) -> Result<(PlanNodeId, usize)> {
        self.resolver
            .iter()
            .rev()
            .find_map(|frame| frame.get(&id).copied())
            .ok_or_else(|| {
                QuereusError::internal(format!(
                    "attribute #{id} is not reachable from any registered row slot"
                ))
            })
    }

    pub fn capture_table(&mut self, table: &Arc<TableSchema>) {
        if !self.captured.iter().any(
            |c| matches!(c, CapturedObject::Table(t) if Arc::ptr_eq(t, table)),
        ) {
            self.captured.push(CapturedObject::Table(Arc::clone(table)));
        }
    }

    pub fn capture_function(&mut self, function: &Arc<FunctionSchema>) {
        if !self.captured.iter().any(
            |c| matches!(c, CapturedObject::Function(f) if Arc::ptr_eq(f, function)),
        ) {
            self.captured
                .push(CapturedObject::Function(Arc::clone(function)));
        }
    }
}

/// Emit a statement plan into an executable scheduler
pub fn emit_program(plan: &PlanNode, session: &Session) -> Result<Scheduler> {
    let mut ctx = EmitCtx::new(session);
    let root = match plan {
        PlanNode::Relational(relational) => emit_relational(relational, &mut ctx)?,
        PlanNode::Sink(sink) => emit_sink(sink, &mut ctx)?,
    };
    trace!(captured = ctx.captured.len(), "statement emitted");
    Ok(Scheduler::new(root, ctx.captured))
}

pub fn emit_relational(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let emitter = REGISTRY.relational.get(&plan.kind()).ok_or_else(|| {
        QuereusError::internal(format!("no emitter registered for {:?}", plan.kind()))
    })?;
    emitter(plan, ctx)
}

pub fn emit_scalar(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let emitter = REGISTRY.scalar.get(&plan.kind()).ok_or_else(|| {
        QuereusError::internal(format!("no emitter registered for {:?}", plan.kind()))
    })?;
    emitter(plan, ctx)
}

pub fn emit_sink(plan: &Arc<SinkPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let emitter = REGISTRY.sink.get(&plan.kind()).ok_or_else(|| {
        QuereusError::internal(format!("no emitter registered for {:?}", plan.kind()))
    })?;
    emitter(plan, ctx)
}

/// Package an instruction subgraph as a standalone sub-scheduler. The
/// produced instruction's `run` returns a closure that executes the
/// subgraph against a fresh child context each invocation; this is how
/// filter predicates, CASE branches, and subqueries re-evaluate per
/// outer row.
pub fn emit_call(inner: Instruction) -> Instruction {
    let program = Rc::new(Scheduler::new(inner, Vec::new()));
    Instruction::leaf(
        "call",
        Box::new(move |_ctx, _args| {
            let program = Rc::clone(&program);
            Ok(Output::Callback(Rc::new(
                move |ctx: &Rc<RuntimeContext>| {
                    let sub = ctx.child();
                    program.run(&sub)
                },
            )))
        }),
    )
}

/// Emit a relational subplan as a callback program
pub fn emit_subplan_callback(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let inner = emit_relational(plan, ctx)?;
    Ok(emit_call(inner))
}

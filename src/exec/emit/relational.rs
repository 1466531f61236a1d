//! Relational emitters.
//!
//! Each produces an instruction whose `run` yields a lazy row stream.
//! Consumers create a row slot for their source node, set it per
//! produced row, and let the slot close when the stream drops; scalar
//! programs packaged as callbacks read the current row through that
//! slot. Row order is preserved except where a node reorders by
//! definition (Sort, hash aggregation).

use super::{emit_call, emit_relational, emit_scalar, emit_sink, EmitCtx};
use crate::error::{QuereusError, Result};
use crate::exec::{
    finish_statement, guarded, Callback, Instruction, Output, RowSlot, RuntimeContext,
};
use crate::plan::{
    AggFunc, ConstraintOp, JoinKind, PlanNode, RelationalPlan, ScalarPlan,
};
use crate::schema::TableSchema;
use crate::value::{Collation, Row, SortKey, Value};
use crate::vtab::{FilterArg, FilterInfo, RowIter};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;

fn stream_from_vec(rows: Vec<Row>) -> RowIter {
    Box::new(rows.into_iter().map(Ok))
}

/// Open a scan on a table, routing through the transaction's
/// connection when one is open so in-transaction writes are visible
pub(super) fn open_scan(
    rctx: &Rc<RuntimeContext>,
    schema: &Arc<TableSchema>,
    filter: FilterInfo,
) -> Result<RowIter> {
    let table = rctx.session.open_table(schema)?;
    let in_txn = rctx.session.txn.borrow().is_in_transaction();
    let result = if in_txn {
        let mut txn = rctx.session.txn.borrow_mut();
        let handle = Arc::clone(&table);
        txn.enlist(&schema.name, move || handle.open_connection())?;
        table.query(txn.connection(&schema.name), filter)
    } else {
        table.query(None, filter)
    };
    result.map_err(|e| QuereusError::from_vtab(&schema.name, e))
}

pub(super) fn emit_single_row(
    plan: &Arc<RelationalPlan>,
    _ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::SingleRow(_) = plan.as_ref() else {
        return Err(QuereusError::internal("single-row emitter got a different node"));
    };
    Ok(Instruction::leaf(
        "single-row",
        Box::new(|_, _| Ok(Output::Rows(Box::new(std::iter::once(Ok(Row::empty())))))),
    ))
}

pub(super) fn emit_values(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Values(node) = plan.as_ref() else {
        return Err(QuereusError::internal("values emitter got a different node"));
    };
    let width = node.attributes.len();
    let mut params = Vec::new();
    for row in &node.rows {
        for cell in row {
            params.push(emit_scalar(cell, ctx)?);
        }
    }
    Ok(Instruction::new(
        "values",
        params,
        Box::new(move |_, args| {
            let values = args
                .into_iter()
                .map(Output::into_value)
                .collect::<Result<Vec<_>>>()?;
            let rows: Vec<Row> = values
                .chunks(width.max(1))
                .map(|chunk| Row::new(chunk.to_vec()))
                .collect();
            Ok(Output::Rows(stream_from_vec(rows)))
        }),
    ))
}

pub(super) fn emit_retrieve(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::Retrieve(node) = plan.as_ref() else {
        return Err(QuereusError::internal("retrieve emitter got a different node"));
    };
    ctx.capture_table(&node.table_ref.table);
    let params = node
        .pushdown
        .iter()
        .map(|constraint| emit_scalar(&constraint.value, ctx))
        .collect::<Result<Vec<_>>>()?;
    let meta: Vec<(usize, ConstraintOp)> = node
        .pushdown
        .iter()
        .map(|constraint| (constraint.column, constraint.op))
        .collect();
    let schema = Arc::clone(&node.table_ref.table);
    let index_name = node.index.as_ref().map(|index| index.name.clone());

    Ok(Instruction::new(
        "retrieve",
        params,
        Box::new(move |rctx, args| {
            let values = args
                .into_iter()
                .map(Output::into_value)
                .collect::<Result<Vec<_>>>()?;
            let filter = FilterInfo {
                index_name: index_name.clone(),
                args: meta
                    .iter()
                    .zip(values)
                    .map(|(&(column, op), value)| FilterArg { column, op, value })
                    .collect(),
            };
            let rows = open_scan(rctx, &schema, filter)?;
            Ok(Output::Rows(guarded(rctx, rows)))
        }),
    ))
}

pub(super) fn emit_remote_query(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::RemoteQuery(node) = plan.as_ref() else {
        return Err(QuereusError::internal("remote emitter got a different node"));
    };
    ctx.capture_table(&node.table);
    let schema = Arc::clone(&node.table);
    let fallback = Arc::clone(&node.fallback);
    let pushdown_ctx = Arc::clone(&node.ctx);

    Ok(Instruction::leaf(
        "remote-query",
        Box::new(move |rctx, _| {
            let table = rctx.session.open_table(&schema)?;
            let in_txn = rctx.session.txn.borrow().is_in_transaction();
            let rows = if in_txn {
                let mut txn = rctx.session.txn.borrow_mut();
                let handle = Arc::clone(&table);
                txn.enlist(&schema.name, move || handle.open_connection())?;
                table.execute_plan(txn.connection(&schema.name), &fallback, &pushdown_ctx)
            } else {
                table.execute_plan(None, &fallback, &pushdown_ctx)
            }
            .map_err(|e| QuereusError::from_vtab(&schema.name, e))?;
            Ok(Output::Rows(guarded(rctx, rows)))
        }),
    ))
}

pub(super) fn emit_project(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::Project(node) = plan.as_ref() else {
        return Err(QuereusError::internal("project emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    ctx.push_descriptor(&node.source);
    let mut params = vec![source_instr];
    for expr in &node.exprs {
        params.push(emit_call(emit_scalar(expr, ctx)?));
    }
    ctx.pop_descriptor();
    let source_id = node.source.id();

    Ok(Instruction::new(
        "project",
        params,
        Box::new(move |rctx, mut args| {
            let callbacks: Vec<Callback> = args
                .split_off(1)
                .into_iter()
                .map(Output::into_callback)
                .collect::<Result<_>>()?;
            let mut source = args.remove(0).into_rows()?;
            let slot = RowSlot::create(rctx, source_id);
            let ctx = Rc::clone(rctx);
            let stream = std::iter::from_fn(move || match source.next() {
                None => None,
                Some(Err(err)) => Some(Err(err)),
                Some(Ok(row)) => {
                    slot.set(row);
                    let mut values = Vec::with_capacity(callbacks.len());
                    for callback in &callbacks {
                        match callback(&ctx).and_then(Output::into_value) {
                            Ok(value) => values.push(value),
                            Err(err) => return Some(Err(err)),
                        }
                    }
                    Some(Ok(Row::new(values)))
                }
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

pub(super) fn emit_filter(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Filter(node) = plan.as_ref() else {
        return Err(QuereusError::internal("filter emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    ctx.push_descriptor(&node.source);
    let predicate = emit_call(emit_scalar(&node.predicate, ctx)?);
    ctx.pop_descriptor();
    let source_id = node.source.id();

    Ok(Instruction::new(
        "filter",
        vec![source_instr, predicate],
        Box::new(move |rctx, mut args| {
            let predicate = args.remove(1).into_callback()?;
            let mut source = args.remove(0).into_rows()?;
            let slot = RowSlot::create(rctx, source_id);
            let ctx = Rc::clone(rctx);
            let stream = std::iter::from_fn(move || loop {
                match source.next() {
                    None => return None,
                    Some(Err(err)) => return Some(Err(err)),
                    Some(Ok(row)) => {
                        slot.set(row.clone());
                        match predicate(&ctx).and_then(Output::into_value) {
                            Err(err) => return Some(Err(err)),
                            Ok(verdict) => {
                                if verdict.is_truthy() {
                                    return Some(Ok(row));
                                }
                            }
                        }
                    }
                }
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

pub(super) fn emit_join(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Join(node) = plan.as_ref() else {
        return Err(QuereusError::internal("join emitter got a different node"));
    };
    let left_instr = emit_relational(&node.left, ctx)?;
    // The right side re-opens per left row
    let right_call = emit_call(emit_relational(&node.right, ctx)?);
    // ON reads the combined row through the join's own slot
    ctx.push_descriptor(plan);
    let on_call = match &node.on {
        Some(on) => Some(emit_call(emit_scalar(on, ctx)?)),
        None => None,
    };
    ctx.pop_descriptor();

    let join_id = node.id;
    let kind = node.kind;
    let right_arity = node.right.arity();
    let mut params = vec![left_instr, right_call];
    if let Some(on) = on_call {
        params.push(on);
    }
    let has_on = node.on.is_some();

    Ok(Instruction::new(
        "join",
        params,
        Box::new(move |rctx, mut args| {
            let on = if has_on {
                Some(args.remove(2).into_callback()?)
            } else {
                None
            };
            let right_factory = args.remove(1).into_callback()?;
            let mut left = args.remove(0).into_rows()?;
            let slot = RowSlot::create(rctx, join_id);
            let ctx = Rc::clone(rctx);

            let mut current_left: Option<Row> = None;
            let mut current_right: Option<RowIter> = None;
            let mut matched = false;

            let stream = std::iter::from_fn(move || loop {
                if current_right.is_none() {
                    match left.next() {
                        None => return None,
                        Some(Err(err)) => return Some(Err(err)),
                        Some(Ok(row)) => {
                            current_left = Some(row);
                            matched = false;
                            match right_factory(&ctx).and_then(Output::into_rows) {
                                Ok(rows) => current_right = Some(rows),
                                Err(err) => return Some(Err(err)),
                            }
                        }
                    }
                }
                let right_iter = current_right
                    .as_mut()
                    .unwrap_or_else(|| unreachable!("right side opened above"));
                match right_iter.next() {
                    Some(Err(err)) => return Some(Err(err)),
                    Some(Ok(right_row)) => {
                        let left_row = current_left
                            .as_ref()
                            .unwrap_or_else(|| unreachable!("left row set with right side"));
                        let mut combined = left_row.values().to_vec();
                        combined.extend(right_row.values().iter().cloned());
                        let combined = Row::new(combined);
                        match &on {
                            None => {
                                matched = true;
                                return Some(Ok(combined));
                            }
                            Some(on) => {
                                slot.set(combined.clone());
                                match on(&ctx).and_then(Output::into_value) {
                                    Err(err) => return Some(Err(err)),
                                    Ok(verdict) => {
                                        if verdict.is_truthy() {
                                            matched = true;
                                            return Some(Ok(combined));
                                        }
                                    }
                                }
                            }
                        }
                    }
                    None => {
                        current_right = None;
                        if kind == JoinKind::LeftOuter && !matched {
                            let left_row = current_left
                                .as_ref()
                                .unwrap_or_else(|| unreachable!("left row set with right side"));
                            let mut padded = left_row.values().to_vec();
                            padded.extend(std::iter::repeat(Value::Null).take(right_arity));
                            return Some(Ok(Row::new(padded)));
                        }
                    }
                }
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

// ----------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------

enum Accum {
    Count {
        n: i64,
    },
    Sum {
        int: i64,
        real: f64,
        is_real: bool,
        any: bool,
    },
    Avg {
        sum: f64,
        n: i64,
    },
    MinMax {
        min: bool,
        best: Option<Value>,
        collation: Collation,
    },
    Total {
        sum: f64,
    },
}

struct AggState {
    accum: Accum,
    /// Values already folded, for DISTINCT aggregates
    seen: Option<BTreeSet<SortKey>>,
}

impl AggState {
    fn new(func: AggFunc, distinct: bool, collation: Collation) -> Self {
        let accum = match func {
            AggFunc::Count => Accum::Count { n: 0 },
            AggFunc::Sum => Accum::Sum {
                int: 0,
                real: 0.0,
                is_real: false,
                any: false,
            },
            AggFunc::Avg => Accum::Avg { sum: 0.0, n: 0 },
            AggFunc::Min => Accum::MinMax {
                min: true,
                best: None,
                collation,
            },
            AggFunc::Max => Accum::MinMax {
                min: false,
                best: None,
                collation,
            },
            AggFunc::Total => Accum::Total { sum: 0.0 },
        };
        AggState {
            accum,
            seen: distinct.then(BTreeSet::new),
        }
    }

    fn update(&mut self, value: Option<Value>) -> Result<()> {
        // `None` means count(*): every row counts
        let Some(value) = value else {
            if let Accum::Count { n } = &mut self.accum {
                *n += 1;
            }
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        if let Some(seen) = &mut self.seen {
            if !seen.insert(SortKey::new(vec![value.clone()])) {
                return Ok(());
            }
        }
        match &mut self.accum {
            Accum::Count { n } => *n += 1,
            Accum::Sum {
                int,
                real,
                is_real,
                any,
            } => {
                *any = true;
                match (&value, *is_real) {
                    (Value::Integer(i), false) => match int.checked_add(*i) {
                        Some(sum) => *int = sum,
                        None => {
                            *is_real = true;
                            *real = *int as f64 + *i as f64;
                        }
                    },
                    _ => {
                        let add = value.as_real().unwrap_or(0.0);
                        if !*is_real {
                            *is_real = true;
                            *real = *int as f64;
                        }
                        *real += add;
                    }
                }
            }
            Accum::Avg { sum, n } => {
                *sum += value.as_real().unwrap_or(0.0);
                *n += 1;
            }
            Accum::MinMax {
                min,
                best,
                collation,
            } => {
                let better = match best {
                    None => true,
                    Some(current) => {
                        let ordering = Value::compare(&value, current, *collation);
                        if *min {
                            ordering == std::cmp::Ordering::Less
                        } else {
                            ordering == std::cmp::Ordering::Greater
                        }
                    }
                };
                if better {
                    *best = Some(value);
                }
            }
            Accum::Total { sum } => *sum += value.as_real().unwrap_or(0.0),
        }
        Ok(())
    }

    fn finalize(self) -> Value {
        match self.accum {
            Accum::Count { n } => Value::Integer(n),
            Accum::Sum {
                int,
                real,
                is_real,
                any,
            } => {
                if !any {
                    Value::Null
                } else if is_real {
                    Value::Real(real)
                } else {
                    Value::Integer(int)
                }
            }
            Accum::Avg { sum, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    Value::Real(sum / n as f64)
                }
            }
            Accum::MinMax { best, .. } => best.unwrap_or(Value::Null),
            Accum::Total { sum } => Value::Real(sum),
        }
    }
}

pub(super) fn emit_aggregate(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::Aggregate(node) = plan.as_ref() else {
        return Err(QuereusError::internal("aggregate emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    ctx.push_descriptor(&node.source);
    let mut params = vec![source_instr];
    for group in &node.group_by {
        params.push(emit_call(emit_scalar(group, ctx)?));
    }
    // (position in params, spec) per aggregate; count(*) has no arg
    let mut specs = Vec::with_capacity(node.aggregates.len());
    for aggregate in &node.aggregates {
        let has_arg = aggregate.arg.is_some();
        let collation = aggregate
            .arg
            .as_ref()
            .map_or(Collation::Binary, ScalarPlan::comparison_collation);
        if let Some(arg) = &aggregate.arg {
            params.push(emit_call(emit_scalar(arg, ctx)?));
        }
        specs.push((aggregate.func, has_arg, aggregate.distinct, collation));
    }
    ctx.pop_descriptor();

    let group_count = node.group_by.len();
    let source_id = node.source.id();

    Ok(Instruction::new(
        "aggregate",
        params,
        Box::new(move |rctx, mut args| {
            let mut callbacks = args.split_off(1).into_iter();
            let mut source = args.remove(0).into_rows()?;
            let group_cbs: Vec<Callback> = (&mut callbacks)
                .take(group_count)
                .map(Output::into_callback)
                .collect::<Result<_>>()?;
            let mut arg_cbs: Vec<Option<Callback>> = Vec::with_capacity(specs.len());
            for (_, has_arg, _, _) in &specs {
                arg_cbs.push(if *has_arg {
                    Some(
                        callbacks
                            .next()
                            .ok_or_else(|| QuereusError::internal("missing aggregate argument"))?
                            .into_callback()?,
                    )
                } else {
                    None
                });
            }

            let slot = RowSlot::create(rctx, source_id);
            let mut groups: BTreeMap<SortKey, Vec<AggState>> = BTreeMap::new();

            while let Some(row) = source.next().transpose()? {
                rctx.check_interrupt()?;
                slot.set(row);
                let mut key_parts = Vec::with_capacity(group_count);
                for group_cb in &group_cbs {
                    key_parts.push(group_cb(rctx)?.into_value()?);
                }
                let key = SortKey::new(key_parts);
                let states = groups.entry(key).or_insert_with(|| {
                    specs
                        .iter()
                        .map(|(func, _, distinct, collation)| {
                            AggState::new(*func, *distinct, *collation)
                        })
                        .collect()
                });
                for (state, arg_cb) in states.iter_mut().zip(&arg_cbs) {
                    let value = match arg_cb {
                        Some(cb) => Some(cb(rctx)?.into_value()?),
                        None => None,
                    };
                    state.update(value)?;
                }
            }
            drop(slot);

            // No GROUP BY yields exactly one row, even over no input
            if groups.is_empty() && group_count == 0 {
                groups.insert(
                    SortKey::new(Vec::new()),
                    specs
                        .iter()
                        .map(|(func, _, distinct, collation)| {
                            AggState::new(*func, *distinct, *collation)
                        })
                        .collect(),
                );
            }

            let rows: Vec<Row> = groups
                .into_iter()
                .map(|(key, states)| {
                    let mut values = key.0;
                    values.extend(states.into_iter().map(AggState::finalize));
                    Row::new(values)
                })
                .collect();
            Ok(Output::Rows(stream_from_vec(rows)))
        }),
    ))
}

pub(super) fn emit_sort(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Sort(node) = plan.as_ref() else {
        return Err(QuereusError::internal("sort emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    ctx.push_descriptor(&node.source);
    let mut params = vec![source_instr];
    let mut key_meta = Vec::with_capacity(node.keys.len());
    for key in &node.keys {
        params.push(emit_call(emit_scalar(&key.expr, ctx)?));
        key_meta.push((key.desc, key.expr.comparison_collation()));
    }
    ctx.pop_descriptor();
    let source_id = node.source.id();

    Ok(Instruction::new(
        "sort",
        params,
        Box::new(move |rctx, mut args| {
            let key_cbs: Vec<Callback> = args
                .split_off(1)
                .into_iter()
                .map(Output::into_callback)
                .collect::<Result<_>>()?;
            let mut source = args.remove(0).into_rows()?;
            let slot = RowSlot::create(rctx, source_id);

            let mut keyed: Vec<(Vec<Value>, Row)> = Vec::new();
            while let Some(row) = source.next().transpose()? {
                rctx.check_interrupt()?;
                slot.set(row.clone());
                let mut key = Vec::with_capacity(key_cbs.len());
                for key_cb in &key_cbs {
                    key.push(key_cb(rctx)?.into_value()?);
                }
                keyed.push((key, row));
            }
            drop(slot);

            let meta = key_meta.clone();
            keyed.sort_by(|(a, _), (b, _)| {
                for (index, (desc, collation)) in meta.iter().enumerate() {
                    let ordering = Value::compare(&a[index], &b[index], *collation);
                    let ordering = if *desc { ordering.reverse() } else { ordering };
                    if ordering != std::cmp::Ordering::Equal {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
            Ok(Output::Rows(stream_from_vec(
                keyed.into_iter().map(|(_, row)| row).collect(),
            )))
        }),
    ))
}

pub(super) fn emit_distinct(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::Distinct(node) = plan.as_ref() else {
        return Err(QuereusError::internal("distinct emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    Ok(Instruction::new(
        "distinct",
        vec![source_instr],
        Box::new(move |rctx, mut args| {
            let mut source = args.remove(0).into_rows()?;
            let mut seen: BTreeSet<SortKey> = BTreeSet::new();
            let stream = std::iter::from_fn(move || loop {
                match source.next() {
                    None => return None,
                    Some(Err(err)) => return Some(Err(err)),
                    Some(Ok(row)) => {
                        let key = SortKey::new(row.values().to_vec());
                        if seen.insert(key) {
                            return Some(Ok(row));
                        }
                    }
                }
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

pub(super) fn emit_limit_offset(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::LimitOffset(node) = plan.as_ref() else {
        return Err(QuereusError::internal("limit emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    let mut params = vec![source_instr];
    let has_limit = node.limit.is_some();
    if let Some(limit) = &node.limit {
        params.push(emit_scalar(limit, ctx)?);
    }
    let has_offset = node.offset.is_some();
    if let Some(offset) = &node.offset {
        params.push(emit_scalar(offset, ctx)?);
    }

    Ok(Instruction::new(
        "limit-offset",
        params,
        Box::new(move |rctx, mut args| {
            let offset_value = if has_offset { args.pop() } else { None };
            let limit_value = if has_limit {
                Some(args.remove(1).into_value()?)
            } else {
                None
            };
            let source = args.remove(0).into_rows()?;

            // A negative or NULL limit means unlimited
            let limit = limit_value
                .and_then(|v| v.as_integer())
                .and_then(|n| if n < 0 { None } else { Some(n as usize) });
            let offset = offset_value
                .map(|o| o.into_value())
                .transpose()?
                .and_then(|v| v.as_integer())
                .map_or(0, |n| n.max(0) as usize);

            let skipped = source.skip(offset);
            let limited: RowIter = match limit {
                Some(n) => Box::new(skipped.take(n)),
                None => Box::new(skipped),
            };
            Ok(Output::Rows(guarded(rctx, limited)))
        }),
    ))
}

pub(super) fn emit_union_all(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::UnionAll(node) = plan.as_ref() else {
        return Err(QuereusError::internal("union emitter got a different node"));
    };
    let left = emit_relational(&node.left, ctx)?;
    let right = emit_relational(&node.right, ctx)?;
    Ok(Instruction::new(
        "union-all",
        vec![left, right],
        Box::new(move |rctx, mut args| {
            let right = args.remove(1).into_rows()?;
            let left = args.remove(0).into_rows()?;
            Ok(Output::Rows(guarded(rctx, Box::new(left.chain(right)))))
        }),
    ))
}

pub(super) fn emit_cte(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Cte(node) = plan.as_ref() else {
        return Err(QuereusError::internal("cte emitter got a different node"));
    };
    let source_instr = emit_relational(&node.source, ctx)?;
    let materialized = node.materialized;
    Ok(Instruction::new(
        "cte",
        vec![source_instr],
        Box::new(move |rctx, mut args| {
            let source = args.remove(0).into_rows()?;
            if materialized {
                let buffered = source.collect::<Result<Vec<Row>>>()?;
                Ok(Output::Rows(stream_from_vec(buffered)))
            } else {
                Ok(Output::Rows(guarded(rctx, source)))
            }
        }),
    ))
}

pub(super) fn emit_block(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Block(node) = plan.as_ref() else {
        return Err(QuereusError::internal("block emitter got a different node"));
    };
    let mut params = Vec::with_capacity(node.statements.len());
    for statement in &node.statements {
        let instruction = match statement {
            PlanNode::Relational(relational) => emit_relational(relational, ctx)?,
            PlanNode::Sink(sink) => emit_sink(sink, ctx)?,
        };
        params.push(emit_call(instruction));
    }

    Ok(Instruction::new(
        "block",
        params,
        Box::new(move |rctx, args| {
            let mut last_rows: Option<Vec<Row>> = None;
            for statement in args {
                let callback = statement.into_callback()?;
                let result = callback(rctx);
                // Each statement runs in its own implicit transaction
                // unless an explicit one is open
                let output = finish_statement(rctx, result)?;
                match output {
                    Output::Rows(rows) => {
                        last_rows = Some(rows.collect::<Result<Vec<Row>>>()?);
                    }
                    Output::Value(_) | Output::Callback(_) | Output::Nothing => {}
                }
            }
            match last_rows {
                Some(rows) => Ok(Output::Rows(stream_from_vec(rows))),
                None => Ok(Output::Nothing),
            }
        }),
    ))
}

//! Mutation-pipeline emitters.
//!
//! Insert/Update/Delete producers shape full-width rows (Update and
//! Delete carry the original primary key in the row sidecar), the
//! constraint check validates NOT NULL and CHECK before anything is
//! written, and the executor applies rows through the virtual-table
//! contract inside the statement's transaction.

use super::{emit_call, emit_relational, emit_scalar, EmitCtx};
use crate::error::{QuereusError, Result};
use crate::exec::{guarded, Callback, Instruction, Output, RowSlot};
use crate::plan::{MutationOp, RelationalPlan};
use crate::value::{Row, RowMeta, TypeAffinity, UpdateRowData, Value};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// Shared shape of the Insert/Update producers: evaluate one
/// expression per table column over each source row
fn emit_column_producer(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
    op: MutationOp,
) -> Result<Instruction> {
    let (table, source, column_exprs) = match plan.as_ref() {
        RelationalPlan::Insert(node) => (&node.table, &node.source, &node.column_exprs),
        RelationalPlan::Update(node) => (&node.table, &node.source, &node.column_exprs),
        _ => return Err(QuereusError::internal("producer emitter got a different node")),
    };
    ctx.capture_table(table);

    let source_instr = emit_relational(source, ctx)?;
    ctx.push_descriptor(source);
    let mut params = vec![source_instr];
    for expr in column_exprs {
        params.push(emit_call(emit_scalar(expr, ctx)?));
    }
    ctx.pop_descriptor();

    let affinities: Vec<TypeAffinity> = table.columns.iter().map(|c| c.affinity).collect();
    let primary_key = table.primary_key.clone();
    let source_id = source.id();
    let is_update = op == MutationOp::Update;

    Ok(Instruction::new(
        if is_update { "update-rows" } else { "insert-rows" },
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
            let affinities = affinities.clone();
            let primary_key = primary_key.clone();

            let stream = std::iter::from_fn(move || match source.next() {
                None => None,
                Some(Err(err)) => Some(Err(err)),
                Some(Ok(old_row)) => {
                    slot.set(old_row.clone());
                    let mut values = Vec::with_capacity(callbacks.len());
                    for (callback, affinity) in callbacks.iter().zip(&affinities) {
                        match callback(&ctx).and_then(Output::into_value) {
                            Ok(value) => values.push(value.apply_affinity(*affinity)),
                            Err(err) => return Some(Err(err)),
                        }
                    }
                    if is_update {
                        // The original key must survive until the
                        // executor targets the stored row
                        let old_keys: Vec<Value> = primary_key
                            .iter()
                            .filter_map(|&i| old_row.get(i).cloned())
                            .collect();
                        let meta = RowMeta {
                            old_key_values: Some(old_keys),
                            update_data: Some(UpdateRowData {
                                old_row: old_row.values().to_vec(),
                                new_row: values.clone(),
                            }),
                        };
                        Some(Ok(Row::with_meta(values, meta)))
                    } else {
                        Some(Ok(Row::new(values)))
                    }
                }
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

pub(super) fn emit_insert(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    emit_column_producer(plan, ctx, MutationOp::Insert)
}

pub(super) fn emit_update(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    emit_column_producer(plan, ctx, MutationOp::Update)
}

pub(super) fn emit_delete(plan: &Arc<RelationalPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let RelationalPlan::Delete(node) = plan.as_ref() else {
        return Err(QuereusError::internal("delete emitter got a different node"));
    };
    ctx.capture_table(&node.table);
    let source_instr = emit_relational(&node.source, ctx)?;
    let primary_key = node.table.primary_key.clone();

    Ok(Instruction::new(
        "delete-rows",
        vec![source_instr],
        Box::new(move |rctx, mut args| {
            let source = args.remove(0).into_rows()?;
            let primary_key = primary_key.clone();
            let stream = source.map(move |item| {
                item.map(|row| {
                    let old_keys: Vec<Value> = primary_key
                        .iter()
                        .filter_map(|&i| row.get(i).cloned())
                        .collect();
                    let meta = RowMeta {
                        old_key_values: Some(old_keys),
                        update_data: None,
                    };
                    Row::with_meta(row.into_values(), meta)
                })
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

pub(super) fn emit_constraint_check(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::ConstraintCheck(node) = plan.as_ref() else {
        return Err(QuereusError::internal("check emitter got a different node"));
    };
    ctx.capture_table(&node.table);
    let source_instr = emit_relational(&node.source, ctx)?;
    ctx.push_descriptor(&node.source);
    let mut params = vec![source_instr];
    for check in &node.checks {
        params.push(emit_call(emit_scalar(check, ctx)?));
    }
    ctx.pop_descriptor();

    let table_name = node.table.name.clone();
    let not_null: Vec<(usize, String)> = node
        .table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.not_null)
        .map(|(i, c)| (i, c.name.clone()))
        .collect();
    let check_names: Vec<String> = node
        .table
        .checks
        .iter()
        .map(|c| c.name.clone().unwrap_or_else(|| c.expr_sql.clone()))
        .collect();
    let source_id = node.source.id();

    Ok(Instruction::new(
        "constraint-check",
        params,
        Box::new(move |rctx, mut args| {
            let checks: Vec<Callback> = args
                .split_off(1)
                .into_iter()
                .map(Output::into_callback)
                .collect::<Result<_>>()?;
            let mut source = args.remove(0).into_rows()?;
            let slot = RowSlot::create(rctx, source_id);
            let ctx = Rc::clone(rctx);
            let table_name = table_name.clone();
            let not_null = not_null.clone();
            let check_names = check_names.clone();

            let stream = std::iter::from_fn(move || match source.next() {
                None => None,
                Some(Err(err)) => Some(Err(err)),
                Some(Ok(row)) => {
                    for (index, column) in &not_null {
                        if row.get(*index).map_or(true, Value::is_null) {
                            return Some(Err(QuereusError::constraint(format!(
                                "NOT NULL constraint failed: {table_name}.{column}"
                            ))));
                        }
                    }
                    slot.set(row.clone());
                    for (check, name) in checks.iter().zip(&check_names) {
                        match check(&ctx).and_then(Output::into_value) {
                            Err(err) => return Some(Err(err)),
                            // NULL check results pass; only false fails
                            Ok(verdict) => {
                                if verdict.to_bool() == Some(false) {
                                    return Some(Err(QuereusError::constraint(format!(
                                        "CHECK constraint failed: {name}"
                                    ))));
                                }
                            }
                        }
                    }
                    Some(Ok(row))
                }
            });
            Ok(Output::Rows(guarded(rctx, Box::new(stream))))
        }),
    ))
}

pub(super) fn emit_dml_executor(
    plan: &Arc<RelationalPlan>,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let RelationalPlan::DmlExecutor(node) = plan.as_ref() else {
        return Err(QuereusError::internal("executor emitter got a different node"));
    };
    ctx.capture_table(&node.table);
    let source_instr = emit_relational(&node.source, ctx)?;
    let schema = Arc::clone(&node.table);
    let op = node.op;

    Ok(Instruction::new(
        "dml-executor",
        vec![source_instr],
        Box::new(move |rctx, mut args| {
            let mut source = args.remove(0).into_rows()?;
            let table = rctx.session.open_table(&schema)?;

            // Writes imply a transaction; open one if the host did not
            rctx.session.txn.borrow_mut().ensure_transaction();
            {
                let mut txn = rctx.session.txn.borrow_mut();
                let handle = Arc::clone(&table);
                txn.enlist(&schema.name, move || handle.open_connection())?;
            }

            let mut count = 0i64;
            while let Some(row) = source.next().transpose()? {
                rctx.check_interrupt()?;
                let result = {
                    let txn = rctx.session.txn.borrow();
                    let conn = txn.connection(&schema.name);
                    match op {
                        MutationOp::Insert => {
                            table.update(conn, op, Some(row.values()), None)
                        }
                        MutationOp::Update => {
                            let keys = row.old_key_values().ok_or_else(|| {
                                QuereusError::internal(
                                    "update row lost its original key values",
                                )
                            })?;
                            table.update(conn, op, Some(row.values()), Some(keys))
                        }
                        MutationOp::Delete => {
                            let keys = row.old_key_values().ok_or_else(|| {
                                QuereusError::internal(
                                    "delete row lost its original key values",
                                )
                            })?;
                            table.update(conn, op, None, Some(keys))
                        }
                    }
                };
                result.map_err(|e| QuereusError::from_vtab(&schema.name, e))?;
                count += 1;
            }
            rctx.add_changes(count);
            debug!(table = %schema.name, rows = count, op = %op, "mutation applied");
            Ok(Output::Nothing)
        }),
    ))
}

//! Sink emitters: DDL, transaction control, PRAGMA, ANALYZE.
//!
//! Sinks produce no rows (PRAGMA reads are the one exception, yielding
//! a single value row). Catalog changes take effect immediately; the
//! transaction coordinator only governs row data.

use super::{emit_scalar, EmitCtx};
use crate::error::{QuereusError, Result};
use crate::exec::{Instruction, Output};
use crate::plan::SinkPlan;
use crate::value::Row;
use crate::vtab::FilterInfo;
use std::sync::Arc;
use tracing::info;

pub(super) fn emit_create_table(
    plan: &Arc<SinkPlan>,
    _ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let SinkPlan::CreateTable {
        table,
        if_not_exists,
    } = plan.as_ref()
    else {
        return Err(QuereusError::internal("create-table emitter got a different node"));
    };
    let table = Arc::clone(table);
    let if_not_exists = *if_not_exists;
    Ok(Instruction::leaf(
        "create-table",
        Box::new(move |rctx, _| {
            rctx.session.txn.borrow_mut().ensure_transaction();
            if if_not_exists && rctx.session.schema.read().table(&table.name).is_some() {
                return Ok(Output::Nothing);
            }
            rctx.session.create_table(Arc::clone(&table))?;
            info!(table = %table.name, module = %table.module_name, "table created");
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_drop_table(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::DropTable { name, if_exists } = plan.as_ref() else {
        return Err(QuereusError::internal("drop-table emitter got a different node"));
    };
    let name = name.clone();
    let if_exists = *if_exists;
    Ok(Instruction::leaf(
        "drop-table",
        Box::new(move |rctx, _| {
            rctx.session.txn.borrow_mut().ensure_transaction();
            if if_exists && rctx.session.schema.read().table(&name).is_none() {
                return Ok(Output::Nothing);
            }
            rctx.session.drop_table(&name)?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_create_index(
    plan: &Arc<SinkPlan>,
    _ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let SinkPlan::CreateIndex {
        index,
        if_not_exists,
    } = plan.as_ref()
    else {
        return Err(QuereusError::internal("create-index emitter got a different node"));
    };
    let index = Arc::clone(index);
    let if_not_exists = *if_not_exists;
    Ok(Instruction::leaf(
        "create-index",
        Box::new(move |rctx, _| {
            rctx.session.txn.borrow_mut().ensure_transaction();
            if if_not_exists && rctx.session.schema.read().index(&index.name).is_some() {
                return Ok(Output::Nothing);
            }
            rctx.session.create_index(Arc::clone(&index))?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_drop_index(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::DropIndex { name, if_exists } = plan.as_ref() else {
        return Err(QuereusError::internal("drop-index emitter got a different node"));
    };
    let name = name.clone();
    let if_exists = *if_exists;
    Ok(Instruction::leaf(
        "drop-index",
        Box::new(move |rctx, _| {
            rctx.session.txn.borrow_mut().ensure_transaction();
            if if_exists && rctx.session.schema.read().index(&name).is_none() {
                return Ok(Output::Nothing);
            }
            rctx.session.drop_index(&name)?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_create_view(
    plan: &Arc<SinkPlan>,
    _ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let SinkPlan::CreateView {
        view,
        if_not_exists,
    } = plan.as_ref()
    else {
        return Err(QuereusError::internal("create-view emitter got a different node"));
    };
    let view = Arc::clone(view);
    let if_not_exists = *if_not_exists;
    Ok(Instruction::leaf(
        "create-view",
        Box::new(move |rctx, _| {
            if if_not_exists && rctx.session.schema.read().view(&view.name).is_some() {
                return Ok(Output::Nothing);
            }
            rctx.session.schema.write().register_view(Arc::clone(&view))?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_drop_view(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::DropView { name, if_exists } = plan.as_ref() else {
        return Err(QuereusError::internal("drop-view emitter got a different node"));
    };
    let name = name.clone();
    let if_exists = *if_exists;
    Ok(Instruction::leaf(
        "drop-view",
        Box::new(move |rctx, _| {
            if if_exists && rctx.session.schema.read().view(&name).is_none() {
                return Ok(Output::Nothing);
            }
            rctx.session.schema.write().drop_view(&name)?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_begin(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Begin = plan.as_ref() else {
        return Err(QuereusError::internal("begin emitter got a different node"));
    };
    Ok(Instruction::leaf(
        "begin",
        Box::new(|rctx, _| {
            rctx.session.txn.borrow_mut().begin()?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_commit(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Commit = plan.as_ref() else {
        return Err(QuereusError::internal("commit emitter got a different node"));
    };
    Ok(Instruction::leaf(
        "commit",
        Box::new(|rctx, _| {
            rctx.session.txn.borrow_mut().commit()?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_rollback(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Rollback { to_savepoint } = plan.as_ref() else {
        return Err(QuereusError::internal("rollback emitter got a different node"));
    };
    let to_savepoint = to_savepoint.clone();
    Ok(Instruction::leaf(
        "rollback",
        Box::new(move |rctx, _| {
            match &to_savepoint {
                Some(name) => rctx.session.txn.borrow_mut().rollback_to_savepoint(name)?,
                None => rctx.session.txn.borrow_mut().rollback()?,
            }
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_savepoint(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Savepoint { name } = plan.as_ref() else {
        return Err(QuereusError::internal("savepoint emitter got a different node"));
    };
    let name = name.clone();
    Ok(Instruction::leaf(
        "savepoint",
        Box::new(move |rctx, _| {
            rctx.session.txn.borrow_mut().create_savepoint(&name)?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_release(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Release { name } = plan.as_ref() else {
        return Err(QuereusError::internal("release emitter got a different node"));
    };
    let name = name.clone();
    Ok(Instruction::leaf(
        "release",
        Box::new(move |rctx, _| {
            rctx.session.txn.borrow_mut().release_savepoint(&name)?;
            Ok(Output::Nothing)
        }),
    ))
}

pub(super) fn emit_pragma(plan: &Arc<SinkPlan>, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Pragma { name, value } = plan.as_ref() else {
        return Err(QuereusError::internal("pragma emitter got a different node"));
    };
    let name = name.clone();
    let params = match value {
        Some(expr) => vec![emit_scalar(expr, ctx)?],
        None => Vec::new(),
    };
    let is_write = value.is_some();
    Ok(Instruction::new(
        "pragma",
        params,
        Box::new(move |rctx, mut args| {
            if is_write {
                // Unknown pragma writes are silently ignored
                let value = args.remove(0).into_value()?;
                rctx.session.set_option(&name, value);
                Ok(Output::Nothing)
            } else {
                // Unknown pragma reads raise
                let value = rctx.session.get_option(&name)?;
                Ok(Output::Rows(Box::new(std::iter::once(Ok(Row::new(vec![
                    value,
                ]))))))
            }
        }),
    ))
}

pub(super) fn emit_analyze(plan: &Arc<SinkPlan>, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let SinkPlan::Analyze { table } = plan.as_ref() else {
        return Err(QuereusError::internal("analyze emitter got a different node"));
    };
    let target = table.clone();
    Ok(Instruction::leaf(
        "analyze",
        Box::new(move |rctx, _| {
            let tables = match &target {
                Some(table) => vec![Arc::clone(table)],
                None => {
                    let names = rctx.session.schema.read().table_names();
                    names
                        .iter()
                        .filter_map(|name| rctx.session.schema.read().table(name))
                        .collect()
                }
            };
            for schema in tables {
                let table = rctx.session.open_table(&schema)?;
                let mut rows = table
                    .query(None, FilterInfo::default())
                    .map_err(|e| QuereusError::from_vtab(&schema.name, e))?;
                let mut count = 0u64;
                while let Some(row) = rows.next().transpose()? {
                    rctx.check_interrupt()?;
                    let _ = row;
                    count += 1;
                }
                schema.set_estimated_rows(count);
                info!(table = %schema.name, rows = count, "statistics refreshed");
            }
            Ok(Output::Nothing)
        }),
    ))
}

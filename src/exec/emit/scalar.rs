//! Scalar emitters.
//!
//! One emitter per scalar plan variant. Synchronous evaluation only;
//! the subquery variants package their plan as a callback and run it
//! per invocation against a child context.

use super::{emit_call, emit_scalar, emit_subplan_callback, EmitCtx};
use crate::ast::{BinaryOp, ParamRef, UnaryOp};
use crate::error::{QuereusError, Result, StatusCode};
use crate::exec::{Instruction, Output};
use crate::plan::{ScalarPlan, WindowFunc};
use crate::value::{Collation, NumericValue, Value};
use regex::Regex;
use std::rc::Rc;

pub(super) fn emit_literal(plan: &ScalarPlan, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Literal { value } = plan else {
        return Err(QuereusError::internal("literal emitter got a different node"));
    };
    let value = value.clone();
    Ok(Instruction::leaf(
        "literal",
        Box::new(move |_, _| Ok(Output::Value(value.clone()))),
    ))
}

pub(super) fn emit_column_ref(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::ColumnRef { attribute } = plan else {
        return Err(QuereusError::internal("column emitter got a different node"));
    };
    let (node, index) = ctx.resolve_attribute(attribute.id)?;
    let name = attribute.name.clone();
    Ok(Instruction::leaf(
        "column",
        Box::new(move |rctx, _| {
            let row = rctx.row(node).ok_or_else(|| {
                QuereusError::internal(format!("no open row slot for column '{name}'"))
            })?;
            let value = row.get(index).cloned().ok_or_else(|| {
                QuereusError::internal(format!("row too narrow for column '{name}'"))
            })?;
            Ok(Output::Value(value))
        }),
    ))
}

pub(super) fn emit_parameter(plan: &ScalarPlan, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Parameter { param, .. } = plan else {
        return Err(QuereusError::internal("parameter emitter got a different node"));
    };
    let param = param.clone();
    Ok(Instruction::leaf(
        "parameter",
        Box::new(move |rctx, _| {
            let value = match &param {
                ParamRef::Positional(index) => rctx.params.get_positional(*index)?,
                ParamRef::Named(name) => rctx.params.get_named(name)?,
            };
            Ok(Output::Value(value))
        }),
    ))
}

pub(super) fn emit_unary(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Unary { op, expr } = plan else {
        return Err(QuereusError::internal("unary emitter got a different node"));
    };
    let inner = emit_scalar(expr, ctx)?;
    let op = *op;
    Ok(Instruction::new(
        "unary",
        vec![inner],
        Box::new(move |_, mut args| {
            let value = args.remove(0).into_value()?;
            let result = match op {
                UnaryOp::Not => match value.to_bool() {
                    None => Value::Null,
                    Some(b) => Value::from_bool(!b),
                },
                UnaryOp::Plus => value,
                UnaryOp::Neg => {
                    if value.is_null() {
                        Value::Null
                    } else {
                        match value.require_numeric("unary -")? {
                            NumericValue::Integer(i) => Value::Integer(
                                i.checked_neg().ok_or_else(|| {
                                    QuereusError::new(StatusCode::Range, "integer overflow")
                                })?,
                            ),
                            NumericValue::Real(f) => Value::Real(-f),
                        }
                    }
                }
            };
            Ok(Output::Value(result))
        }),
    ))
}

pub(super) fn emit_binary(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Binary {
        op,
        left,
        right,
        collation,
    } = plan
    else {
        return Err(QuereusError::internal("binary emitter got a different node"));
    };
    let (op, collation) = (*op, *collation);

    // AND/OR evaluate lazily so the right side can be skipped
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let left_instr = emit_scalar(left, ctx)?;
        let right_call = emit_call(emit_scalar(right, ctx)?);
        return Ok(Instruction::new(
            "logic",
            vec![left_instr, right_call],
            Box::new(move |rctx, mut args| {
                let right_cb = args.remove(1).into_callback()?;
                let left_value = args.remove(0).into_value()?;
                let left_bool = left_value.to_bool();
                match (op, left_bool) {
                    (BinaryOp::And, Some(false)) => return Ok(Output::Value(Value::Integer(0))),
                    (BinaryOp::Or, Some(true)) => return Ok(Output::Value(Value::Integer(1))),
                    _ => {}
                }
                let right_bool = right_cb(rctx)?.into_value()?.to_bool();
                let result = match op {
                    BinaryOp::And => match (left_bool, right_bool) {
                        (_, Some(false)) => Value::Integer(0),
                        (Some(true), Some(true)) => Value::Integer(1),
                        _ => Value::Null,
                    },
                    BinaryOp::Or => match (left_bool, right_bool) {
                        (_, Some(true)) => Value::Integer(1),
                        (Some(false), Some(false)) => Value::Integer(0),
                        _ => Value::Null,
                    },
                    _ => unreachable!("guarded above"),
                };
                Ok(Output::Value(result))
            }),
        ));
    }

    let left_instr = emit_scalar(left, ctx)?;
    let right_instr = emit_scalar(right, ctx)?;
    Ok(Instruction::new(
        "binary",
        vec![left_instr, right_instr],
        Box::new(move |_, mut args| {
            let right = args.remove(1).into_value()?;
            let left = args.remove(0).into_value()?;
            Ok(Output::Value(eval_binary(op, collation, left, right)?))
        }),
    ))
}

fn eval_binary(op: BinaryOp, collation: Collation, left: Value, right: Value) -> Result<Value> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let l = left.require_numeric(op_name(op))?;
            let r = right.require_numeric(op_name(op))?;
            arithmetic(op, l, r)
        }
        BinaryOp::Concat => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Text(format!(
                "{}{}",
                left.to_display_string(),
                right.to_display_string()
            )))
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ordering) = Value::sql_cmp(&left, &right, collation) else {
                return Ok(Value::Null);
            };
            let result = match op {
                BinaryOp::Eq => ordering == std::cmp::Ordering::Equal,
                BinaryOp::Ne => ordering != std::cmp::Ordering::Equal,
                BinaryOp::Lt => ordering == std::cmp::Ordering::Less,
                BinaryOp::Le => ordering != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!("comparison arm"),
            };
            Ok(Value::from_bool(result))
        }
        BinaryOp::Is => Ok(Value::from_bool(Value::is_eq(&left, &right, collation))),
        BinaryOp::IsNot => Ok(Value::from_bool(!Value::is_eq(&left, &right, collation))),
        BinaryOp::And | BinaryOp::Or => Err(QuereusError::internal(
            "AND/OR must be emitted as lazy logic instructions",
        )),
    }
}

fn op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        _ => "?",
    }
}

fn arithmetic(op: BinaryOp, left: NumericValue, right: NumericValue) -> Result<Value> {
    use NumericValue::{Integer, Real};
    let overflow = || QuereusError::new(StatusCode::Range, "integer overflow");
    match (left, right) {
        (Integer(l), Integer(r)) => match op {
            BinaryOp::Add => l.checked_add(r).map(Value::Integer).ok_or_else(overflow),
            BinaryOp::Sub => l.checked_sub(r).map(Value::Integer).ok_or_else(overflow),
            BinaryOp::Mul => l.checked_mul(r).map(Value::Integer).ok_or_else(overflow),
            BinaryOp::Div => {
                if r == 0 {
                    Ok(Value::Null)
                } else {
                    l.checked_div(r).map(Value::Integer).ok_or_else(overflow)
                }
            }
            BinaryOp::Mod => {
                if r == 0 {
                    Ok(Value::Null)
                } else {
                    l.checked_rem(r).map(Value::Integer).ok_or_else(overflow)
                }
            }
            _ => Err(QuereusError::internal("non-arithmetic op in arithmetic()")),
        },
        (l, r) => {
            let (l, r) = (to_real(l), to_real(r));
            let result = match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => {
                    if r == 0.0 {
                        return Ok(Value::Null);
                    }
                    l / r
                }
                BinaryOp::Mod => {
                    if r == 0.0 {
                        return Ok(Value::Null);
                    }
                    l % r
                }
                _ => return Err(QuereusError::internal("non-arithmetic op in arithmetic()")),
            };
            Ok(Value::Real(result))
        }
    }
}

fn to_real(v: NumericValue) -> f64 {
    match v {
        NumericValue::Integer(i) => i as f64,
        NumericValue::Real(f) => f,
    }
}

pub(super) fn emit_function_call(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::FunctionCall { function, args } = plan else {
        return Err(QuereusError::internal("function emitter got a different node"));
    };
    ctx.capture_function(function);
    let params = args
        .iter()
        .map(|arg| emit_scalar(arg, ctx))
        .collect::<Result<Vec<_>>>()?;
    let function = std::sync::Arc::clone(function);
    Ok(Instruction::new(
        "function",
        params,
        Box::new(move |_, args| {
            let values = args
                .into_iter()
                .map(Output::into_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(Output::Value((function.func)(&values)?))
        }),
    ))
}

pub(super) fn emit_window_call(plan: &ScalarPlan, _ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::WindowCall { id, func } = plan else {
        return Err(QuereusError::internal("window emitter got a different node"));
    };
    let (id, func) = (*id, *func);
    Ok(Instruction::leaf(
        "window",
        Box::new(move |rctx, _| {
            let value = match func {
                // Flat per-statement counter; the empty window frame
                // makes every row its own position
                WindowFunc::RowNumber => rctx.window_next(id),
                // All rows are peers of the empty window
                WindowFunc::Rank => 1,
            };
            Ok(Output::Value(Value::Integer(value)))
        }),
    ))
}

pub(super) fn emit_case(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Case {
        operand,
        whens,
        else_expr,
    } = plan
    else {
        return Err(QuereusError::internal("case emitter got a different node"));
    };

    let has_operand = operand.is_some();
    let mut params = Vec::new();
    if let Some(op) = operand {
        params.push(emit_scalar(op, ctx)?);
    }
    // Branches are callbacks so only the taken arm evaluates
    for (when, then) in whens {
        params.push(emit_call(emit_scalar(when, ctx)?));
        params.push(emit_call(emit_scalar(then, ctx)?));
    }
    let has_else = else_expr.is_some();
    if let Some(else_expr) = else_expr {
        params.push(emit_call(emit_scalar(else_expr, ctx)?));
    }

    Ok(Instruction::new(
        "case",
        params,
        Box::new(move |rctx, mut args| {
            let operand_value = if has_operand {
                Some(args.remove(0).into_value()?)
            } else {
                None
            };
            let else_cb = if has_else { args.pop() } else { None };
            let mut pairs = args.into_iter();
            while let (Some(when), Some(then)) = (pairs.next(), pairs.next()) {
                let when_cb = when.into_callback()?;
                let matched = match &operand_value {
                    Some(operand) => {
                        let candidate = when_cb(rctx)?.into_value()?;
                        Value::sql_eq(operand, &candidate, Collation::Binary) == Some(true)
                    }
                    None => when_cb(rctx)?.into_value()?.is_truthy(),
                };
                if matched {
                    let then_cb = then.into_callback()?;
                    return Ok(Output::Value(then_cb(rctx)?.into_value()?));
                }
            }
            match else_cb {
                Some(cb) => Ok(Output::Value(cb.into_callback()?(rctx)?.into_value()?)),
                None => Ok(Output::Value(Value::Null)),
            }
        }),
    ))
}

pub(super) fn emit_cast(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Cast { expr, affinity } = plan else {
        return Err(QuereusError::internal("cast emitter got a different node"));
    };
    let inner = emit_scalar(expr, ctx)?;
    let affinity = *affinity;
    Ok(Instruction::new(
        "cast",
        vec![inner],
        Box::new(move |_, mut args| {
            Ok(Output::Value(args.remove(0).into_value()?.cast_to(affinity)))
        }),
    ))
}

pub(super) fn emit_collate(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Collate { expr, .. } = plan else {
        return Err(QuereusError::internal("collate emitter got a different node"));
    };
    // The collation already flowed into the enclosing comparison at
    // build time; at runtime this is the identity
    emit_scalar(expr, ctx)
}

pub(super) fn emit_is_null(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::IsNull { expr, negated } = plan else {
        return Err(QuereusError::internal("isnull emitter got a different node"));
    };
    let inner = emit_scalar(expr, ctx)?;
    let negated = *negated;
    Ok(Instruction::new(
        "isnull",
        vec![inner],
        Box::new(move |_, mut args| {
            let is_null = args.remove(0).into_value()?.is_null();
            Ok(Output::Value(Value::from_bool(is_null != negated)))
        }),
    ))
}

pub(super) fn emit_like(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Like {
        expr,
        pattern,
        escape,
        negated,
    } = plan
    else {
        return Err(QuereusError::internal("like emitter got a different node"));
    };
    let negated = *negated;

    // Literal patterns compile once at emit time
    let precompiled: Option<Rc<Regex>> = match (pattern.as_ref(), escape) {
        (ScalarPlan::Literal { value: Value::Text(p) }, None) => {
            Some(Rc::new(like_to_regex(p, None)?))
        }
        _ => None,
    };

    let mut params = vec![emit_scalar(expr, ctx)?, emit_scalar(pattern, ctx)?];
    let has_escape = escape.is_some();
    if let Some(escape) = escape {
        params.push(emit_scalar(escape, ctx)?);
    }

    Ok(Instruction::new(
        "like",
        params,
        Box::new(move |_, mut args| {
            let escape_value = if has_escape { args.pop() } else { None };
            let pattern_value = args.remove(1).into_value()?;
            let subject = args.remove(0).into_value()?;
            if subject.is_null() || pattern_value.is_null() {
                return Ok(Output::Value(Value::Null));
            }

            let regex = match &precompiled {
                Some(regex) => Rc::clone(regex),
                None => {
                    let Value::Text(pattern_text) = &pattern_value else {
                        return Ok(Output::Value(Value::from_bool(negated)));
                    };
                    let escape_char = match escape_value {
                        Some(output) => {
                            let value = output.into_value()?;
                            let Value::Text(text) = &value else {
                                return Err(QuereusError::mismatch(
                                    "ESCAPE expression must be a single character",
                                ));
                            };
                            let mut chars = text.chars();
                            match (chars.next(), chars.next()) {
                                (Some(c), None) => Some(c),
                                _ => {
                                    return Err(QuereusError::mismatch(
                                        "ESCAPE expression must be a single character",
                                    ));
                                }
                            }
                        }
                        None => None,
                    };
                    Rc::new(like_to_regex(pattern_text, escape_char)?)
                }
            };

            let subject_text = match &subject {
                Value::Text(s) => s.clone(),
                other => other.to_display_string(),
            };
            let matched = regex.is_match(&subject_text);
            Ok(Output::Value(Value::from_bool(matched != negated)))
        }),
    ))
}

/// Translate a SQL LIKE pattern into an anchored regex.
/// `%` matches any run, `_` any single character; matching is
/// ASCII-case-insensitive like the default LIKE.
fn like_to_regex(pattern: &str, escape: Option<char>) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?is)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if escape == Some(c) {
            match chars.next() {
                Some(escaped) => source.push_str(&regex::escape(&escaped.to_string())),
                None => {
                    return Err(QuereusError::mismatch(
                        "LIKE pattern ends in its escape character",
                    ));
                }
            }
        } else if c == '%' {
            source.push_str(".*");
        } else if c == '_' {
            source.push('.');
        } else {
            source.push_str(&regex::escape(&c.to_string()));
        }
    }
    source.push('$');
    Regex::new(&source)
        .map_err(|e| QuereusError::mismatch(format!("bad LIKE pattern: {e}")))
}

pub(super) fn emit_in_list(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::InList {
        expr,
        items,
        negated,
        collation,
    } = plan
    else {
        return Err(QuereusError::internal("in emitter got a different node"));
    };
    let (negated, collation) = (*negated, *collation);
    let mut params = vec![emit_scalar(expr, ctx)?];
    for item in items {
        params.push(emit_scalar(item, ctx)?);
    }
    Ok(Instruction::new(
        "in-list",
        params,
        Box::new(move |_, mut args| {
            let needle = args.remove(0).into_value()?;
            let mut saw_null = needle.is_null();
            for item in args {
                let candidate = item.into_value()?;
                match Value::sql_eq(&needle, &candidate, collation) {
                    Some(true) => return Ok(Output::Value(Value::from_bool(!negated))),
                    Some(false) => {}
                    None => saw_null = true,
                }
            }
            Ok(Output::Value(if saw_null {
                Value::Null
            } else {
                Value::from_bool(negated)
            }))
        }),
    ))
}

pub(super) fn emit_in_subquery(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::InSubquery {
        expr,
        subplan,
        negated,
        collation,
    } = plan
    else {
        return Err(QuereusError::internal("in emitter got a different node"));
    };
    let (negated, collation) = (*negated, *collation);
    let needle_instr = emit_scalar(expr, ctx)?;
    let rows_call = emit_subplan_callback(subplan, ctx)?;
    Ok(Instruction::new(
        "in-subquery",
        vec![needle_instr, rows_call],
        Box::new(move |rctx, mut args| {
            let rows_cb = args.remove(1).into_callback()?;
            let needle = args.remove(0).into_value()?;
            let mut rows = rows_cb(rctx)?.into_rows()?;
            let mut saw_null = false;
            while let Some(row) = rows.next().transpose()? {
                let candidate = row.get(0).cloned().unwrap_or(Value::Null);
                if needle.is_null() {
                    // NULL IN (non-empty set) is unknown
                    return Ok(Output::Value(Value::Null));
                }
                match Value::sql_eq(&needle, &candidate, collation) {
                    Some(true) => return Ok(Output::Value(Value::from_bool(!negated))),
                    Some(false) => {}
                    None => saw_null = true,
                }
            }
            Ok(Output::Value(if saw_null {
                Value::Null
            } else {
                Value::from_bool(negated)
            }))
        }),
    ))
}

pub(super) fn emit_exists(plan: &ScalarPlan, ctx: &mut EmitCtx<'_>) -> Result<Instruction> {
    let ScalarPlan::Exists { subplan, negated } = plan else {
        return Err(QuereusError::internal("exists emitter got a different node"));
    };
    let negated = *negated;
    let rows_call = emit_subplan_callback(subplan, ctx)?;
    Ok(Instruction::new(
        "exists",
        vec![rows_call],
        Box::new(move |rctx, mut args| {
            let rows_cb = args.remove(0).into_callback()?;
            let mut rows = rows_cb(rctx)?.into_rows()?;
            let found = rows.next().transpose()?.is_some();
            Ok(Output::Value(Value::from_bool(found != negated)))
        }),
    ))
}

pub(super) fn emit_scalar_subquery(
    plan: &ScalarPlan,
    ctx: &mut EmitCtx<'_>,
) -> Result<Instruction> {
    let ScalarPlan::ScalarSubquery { subplan } = plan else {
        return Err(QuereusError::internal("subquery emitter got a different node"));
    };
    let rows_call = emit_subplan_callback(subplan, ctx)?;
    Ok(Instruction::new(
        "scalar-subquery",
        vec![rows_call],
        Box::new(move |rctx, mut args| {
            let rows_cb = args.remove(0).into_callback()?;
            let mut rows = rows_cb(rctx)?.into_rows()?;
            let value = match rows.next().transpose()? {
                Some(row) => row.get(0).cloned().unwrap_or(Value::Null),
                None => Value::Null,
            };
            Ok(Output::Value(value))
        }),
    ))
}

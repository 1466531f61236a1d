//! Scalar expression compilation.
//!
//! Turns `ast::Expr` trees into typed [`ScalarPlan`]s, resolving column
//! references through the scope chain, functions through the catalog,
//! and subqueries through the select builder. Aggregate queries compile
//! result expressions in a rewrite mode that maps GROUP BY expressions
//! and aggregate calls onto the aggregate node's output attributes.

use super::{Planner, Scope};
use crate::ast::{is_aggregate_name, BinaryOp, Expr, WindowSpec};
use crate::error::{QuereusError, Result, StatusCode};
use crate::plan::{next_plan_node_id, Attribute, ScalarPlan, ScalarType, WindowFunc};
use crate::value::{Collation, TypeAffinity};

/// One aggregate call lifted out of a result or HAVING expression
#[derive(Debug, Clone)]
pub(crate) struct AggCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub star: bool,
    pub distinct: bool,
}

impl AggCall {
    fn matches(&self, name: &str, args: &[Expr], star: bool, distinct: bool) -> bool {
        self.name.eq_ignore_ascii_case(name)
            && self.star == star
            && self.distinct == distinct
            && self.args.len() == args.len()
            && self.args.iter().zip(args).all(|(a, b)| ast_eq(a, b))
    }
}

/// Rewrite context for expressions above an Aggregate node
pub(crate) struct AggContext {
    /// GROUP BY expressions and the attributes carrying their values
    pub group: Vec<(Expr, Attribute)>,
    /// Aggregate calls and the attributes carrying their results
    pub aggregates: Vec<(AggCall, Attribute)>,
}

impl<'s> Planner<'s> {
    /// Compile an expression in a plain row context
    pub(crate) fn compile_expr(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<ScalarPlan> {
        self.compile_inner(expr, scope, None)
    }

    /// Compile an expression above an Aggregate node
    pub(crate) fn compile_expr_agg(
        &mut self,
        expr: &Expr,
        scope: &Scope<'_>,
        agg: &AggContext,
    ) -> Result<ScalarPlan> {
        self.compile_inner(expr, scope, Some(agg))
    }

    fn compile_inner(
        &mut self,
        expr: &Expr,
        scope: &Scope<'_>,
        agg: Option<&AggContext>,
    ) -> Result<ScalarPlan> {
        if let Some(context) = agg {
            // A whole-expression GROUP BY match reads the group column
            for (group_expr, attribute) in &context.group {
                if ast_eq(expr, group_expr) {
                    return Ok(ScalarPlan::column(attribute.clone()));
                }
            }
            // An aggregate call reads the aggregate output
            if let Expr::Function {
                name,
                args,
                star,
                distinct,
                over: None,
                ..
            } = expr
            {
                if is_aggregate_name(name) {
                    for (call, attribute) in &context.aggregates {
                        if call.matches(name, args, *star, *distinct) {
                            return Ok(ScalarPlan::column(attribute.clone()));
                        }
                    }
                    return Err(QuereusError::internal(format!(
                        "aggregate call {name}() was not collected"
                    )));
                }
            }
        }

        match expr {
            Expr::Literal(value) => Ok(ScalarPlan::literal(value.clone())),
            Expr::Column { table, name, loc } => {
                if agg.is_some() {
                    return Err(QuereusError::new(
                        StatusCode::Error,
                        format!(
                            "column '{name}' must appear in the GROUP BY clause \
                             or be used in an aggregate function"
                        ),
                    )
                    .at(*loc));
                }
                let attribute = scope.resolve(table.as_deref(), name, *loc)?;
                Ok(ScalarPlan::column(attribute))
            }
            Expr::Parameter(param) => Ok(ScalarPlan::Parameter {
                param: param.clone(),
                ty: self
                    .param_hint(param)
                    .unwrap_or_else(|| ScalarType::new(TypeAffinity::Numeric)),
            }),
            Expr::Unary { op, expr } => Ok(ScalarPlan::Unary {
                op: *op,
                expr: Box::new(self.compile_inner(expr, scope, agg)?),
            }),
            Expr::Binary { op, left, right } => {
                let left = self.compile_inner(left, scope, agg)?;
                let right = self.compile_inner(right, scope, agg)?;
                let collation = if op.is_comparison() {
                    comparison_collation(&left, &right)
                } else {
                    Collation::Binary
                };
                Ok(ScalarPlan::Binary {
                    op: *op,
                    left: Box::new(left),
                    right: Box::new(right),
                    collation,
                })
            }
            Expr::Function {
                name,
                args,
                star,
                distinct,
                over,
                loc,
            } => self.compile_function(name, args, *star, *distinct, over.as_ref(), *loc, scope, agg),
            Expr::Case {
                operand,
                whens,
                else_expr,
            } => {
                let operand = match operand {
                    Some(op) => Some(Box::new(self.compile_inner(op, scope, agg)?)),
                    None => None,
                };
                let whens = whens
                    .iter()
                    .map(|(when, then)| {
                        Ok((
                            self.compile_inner(when, scope, agg)?,
                            self.compile_inner(then, scope, agg)?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let else_expr = match else_expr {
                    Some(e) => Some(Box::new(self.compile_inner(e, scope, agg)?)),
                    None => None,
                };
                Ok(ScalarPlan::Case {
                    operand,
                    whens,
                    else_expr,
                })
            }
            Expr::Cast { expr, type_name } => Ok(ScalarPlan::Cast {
                expr: Box::new(self.compile_inner(expr, scope, agg)?),
                affinity: TypeAffinity::from_declared_type(type_name),
            }),
            Expr::Collate { expr, collation } => Ok(ScalarPlan::Collate {
                expr: Box::new(self.compile_inner(expr, scope, agg)?),
                collation: Collation::resolve(collation)?,
            }),
            Expr::IsNull { expr, negated } => Ok(ScalarPlan::IsNull {
                expr: Box::new(self.compile_inner(expr, scope, agg)?),
                negated: *negated,
            }),
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => Ok(ScalarPlan::Like {
                expr: Box::new(self.compile_inner(expr, scope, agg)?),
                pattern: Box::new(self.compile_inner(pattern, scope, agg)?),
                escape: match escape {
                    Some(e) => Some(Box::new(self.compile_inner(e, scope, agg)?)),
                    None => None,
                },
                negated: *negated,
            }),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let needle = self.compile_inner(expr, scope, agg)?;
                let items = list
                    .iter()
                    .map(|item| self.compile_inner(item, scope, agg))
                    .collect::<Result<Vec<_>>>()?;
                let collation = needle.comparison_collation();
                Ok(ScalarPlan::InList {
                    expr: Box::new(needle),
                    items,
                    negated: *negated,
                    collation,
                })
            }
            Expr::InSelect {
                expr,
                select,
                negated,
            } => {
                let needle = self.compile_inner(expr, scope, agg)?;
                let subplan = self.build_select(select, scope)?;
                if subplan.arity() != 1 {
                    return Err(QuereusError::mismatch(format!(
                        "sub-select returns {} columns - expected 1",
                        subplan.arity()
                    )));
                }
                let collation = comparison_collation(
                    &needle,
                    &ScalarPlan::column(subplan.attributes()[0].clone()),
                );
                Ok(ScalarPlan::InSubquery {
                    expr: Box::new(needle),
                    subplan,
                    negated: *negated,
                    collation,
                })
            }
            Expr::Exists { select, negated } => Ok(ScalarPlan::Exists {
                subplan: self.build_select(select, scope)?,
                negated: *negated,
            }),
            Expr::Subquery(select) => {
                let subplan = self.build_select(select, scope)?;
                if subplan.arity() != 1 {
                    return Err(QuereusError::mismatch(format!(
                        "scalar sub-select returns {} columns - expected 1",
                        subplan.arity()
                    )));
                }
                Ok(ScalarPlan::ScalarSubquery { subplan })
            }
        }
    }

    fn compile_function(
        &mut self,
        name: &str,
        args: &[Expr],
        star: bool,
        distinct: bool,
        over: Option<&WindowSpec>,
        loc: crate::error::SourceLocation,
        scope: &Scope<'_>,
        agg: Option<&AggContext>,
    ) -> Result<ScalarPlan> {
        if over.is_some() {
            if !args.is_empty() || star || distinct {
                return Err(
                    QuereusError::unsupported("window functions take no arguments").at(loc)
                );
            }
            let func = match name.to_ascii_lowercase().as_str() {
                "row_number" => WindowFunc::RowNumber,
                "rank" => WindowFunc::Rank,
                other => {
                    return Err(QuereusError::unsupported(format!(
                        "unsupported window function: {other}"
                    ))
                    .at(loc));
                }
            };
            return Ok(ScalarPlan::WindowCall {
                id: next_plan_node_id(),
                func,
            });
        }

        if is_aggregate_name(name) {
            // Reachable only outside an aggregate rewrite context
            return Err(QuereusError::misuse(format!(
                "misuse of aggregate function {name}()"
            ))
            .at(loc));
        }
        if star || distinct {
            return Err(QuereusError::syntax(
                format!("'{name}' does not accept * or DISTINCT arguments"),
                loc.line,
                loc.column,
            ));
        }

        let function = self
            .session()
            .schema
            .read()
            .function(name, args.len())
            .ok_or_else(|| {
                QuereusError::not_found(format!(
                    "no such function: {name}/{argc}",
                    argc = args.len()
                ))
                .at(loc)
            })?;
        let args = args
            .iter()
            .map(|arg| self.compile_inner(arg, scope, agg))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScalarPlan::FunctionCall { function, args })
    }

    fn param_hint(&self, param: &crate::ast::ParamRef) -> Option<ScalarType> {
        self.param_hints.get(param).copied()
    }
}

/// Collation for a comparison: an explicit COLLATE wins, then the left
/// operand's collation, then the right's
pub(crate) fn comparison_collation(left: &ScalarPlan, right: &ScalarPlan) -> Collation {
    let explicit = |p: &ScalarPlan| matches!(p, ScalarPlan::Collate { .. });
    if explicit(left) {
        return left.comparison_collation();
    }
    if explicit(right) {
        return right.comparison_collation();
    }
    match left.comparison_collation() {
        Collation::Binary => right.comparison_collation(),
        other => other,
    }
}

/// Collect aggregate calls in an expression, without descending into
/// subqueries (they aggregate independently)
pub(crate) fn collect_aggregates(expr: &Expr, out: &mut Vec<AggCall>) -> Result<()> {
    match expr {
        Expr::Function {
            name,
            args,
            star,
            distinct,
            over: None,
            loc,
        } if is_aggregate_name(name) => {
            for arg in args {
                if arg.contains_aggregate() {
                    return Err(QuereusError::syntax(
                        "aggregate functions cannot be nested",
                        loc.line,
                        loc.column,
                    ));
                }
            }
            let call = AggCall {
                name: name.clone(),
                args: args.clone(),
                star: *star,
                distinct: *distinct,
            };
            if !out
                .iter()
                .any(|c| c.matches(&call.name, &call.args, call.star, call.distinct))
            {
                out.push(call);
            }
            Ok(())
        }
        Expr::Function { args, .. } => {
            for arg in args {
                collect_aggregates(arg, out)?;
            }
            Ok(())
        }
        Expr::Unary { expr, .. }
        | Expr::Cast { expr, .. }
        | Expr::Collate { expr, .. }
        | Expr::IsNull { expr, .. } => collect_aggregates(expr, out),
        Expr::Binary { left, right, .. } => {
            collect_aggregates(left, out)?;
            collect_aggregates(right, out)
        }
        Expr::Case {
            operand,
            whens,
            else_expr,
        } => {
            if let Some(op) = operand {
                collect_aggregates(op, out)?;
            }
            for (when, then) in whens {
                collect_aggregates(when, out)?;
                collect_aggregates(then, out)?;
            }
            if let Some(e) = else_expr {
                collect_aggregates(e, out)?;
            }
            Ok(())
        }
        Expr::Like { expr, pattern, .. } => {
            collect_aggregates(expr, out)?;
            collect_aggregates(pattern, out)
        }
        Expr::InList { expr, list, .. } => {
            collect_aggregates(expr, out)?;
            for item in list {
                collect_aggregates(item, out)?;
            }
            Ok(())
        }
        Expr::InSelect { expr, .. } => collect_aggregates(expr, out),
        _ => Ok(()),
    }
}

/// Structural equality over AST expressions, ignoring source locations
pub(crate) fn ast_eq(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Literal(x), Expr::Literal(y)) => x == y,
        (
            Expr::Column {
                table: ta, name: na, ..
            },
            Expr::Column {
                table: tb, name: nb, ..
            },
        ) => {
            na.eq_ignore_ascii_case(nb)
                && match (ta, tb) {
                    (None, None) => true,
                    (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
                    _ => false,
                }
        }
        (Expr::Parameter(x), Expr::Parameter(y)) => x == y,
        (
            Expr::Unary { op: oa, expr: ea },
            Expr::Unary { op: ob, expr: eb },
        ) => oa == ob && ast_eq(ea, eb),
        (
            Expr::Binary {
                op: oa,
                left: la,
                right: ra,
            },
            Expr::Binary {
                op: ob,
                left: lb,
                right: rb,
            },
        ) => oa == ob && ast_eq(la, lb) && ast_eq(ra, rb),
        (
            Expr::Function {
                name: na,
                args: aa,
                star: sa,
                distinct: da,
                over: oa,
                ..
            },
            Expr::Function {
                name: nb,
                args: ab,
                star: sb,
                distinct: db,
                over: ob,
                ..
            },
        ) => {
            na.eq_ignore_ascii_case(nb)
                && sa == sb
                && da == db
                && oa.is_some() == ob.is_some()
                && aa.len() == ab.len()
                && aa.iter().zip(ab).all(|(x, y)| ast_eq(x, y))
        }
        (
            Expr::Cast {
                expr: ea,
                type_name: ta,
            },
            Expr::Cast {
                expr: eb,
                type_name: tb,
            },
        ) => ta.eq_ignore_ascii_case(tb) && ast_eq(ea, eb),
        (
            Expr::Collate {
                expr: ea,
                collation: ca,
            },
            Expr::Collate {
                expr: eb,
                collation: cb,
            },
        ) => ca.eq_ignore_ascii_case(cb) && ast_eq(ea, eb),
        (
            Expr::IsNull {
                expr: ea,
                negated: na,
            },
            Expr::IsNull {
                expr: eb,
                negated: nb,
            },
        ) => na == nb && ast_eq(ea, eb),
        _ => false,
    }
}

/// True when `op` flips under operand swap (used by push-down)
pub(crate) fn mirror_op(op: BinaryOp) -> Option<BinaryOp> {
    match op {
        BinaryOp::Eq => Some(BinaryOp::Eq),
        BinaryOp::Lt => Some(BinaryOp::Gt),
        BinaryOp::Le => Some(BinaryOp::Ge),
        BinaryOp::Gt => Some(BinaryOp::Lt),
        BinaryOp::Ge => Some(BinaryOp::Le),
        _ => None,
    }
}

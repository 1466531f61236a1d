//! Scalar plan nodes.
//!
//! A scalar node produces one value per invocation in some row context.
//! Types are inferred bottom-up: affinities propagate (integer + real
//! is real, concatenation is text, comparisons are integer 0/1/NULL)
//! and nullability follows "any NULL operand makes the result NULL"
//! except for IS, COALESCE/IFNULL, and outer-join padding.

use super::{Attribute, RelationalPlan, ScalarType};
use crate::ast::{BinaryOp, ParamRef, UnaryOp};
use crate::schema::FunctionSchema;
use crate::value::{Collation, TypeAffinity, Value};
use std::fmt;
use std::sync::Arc;

/// Window functions supported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunc {
    RowNumber,
    Rank,
}

/// A scalar expression over plan attributes
#[derive(Debug, Clone)]
pub enum ScalarPlan {
    Literal {
        value: Value,
    },
    ColumnRef {
        attribute: Attribute,
    },
    Parameter {
        param: ParamRef,
        ty: ScalarType,
    },
    Unary {
        op: UnaryOp,
        expr: Box<ScalarPlan>,
    },
    Binary {
        op: BinaryOp,
        left: Box<ScalarPlan>,
        right: Box<ScalarPlan>,
        /// Collation used when `op` compares text, resolved at build time
        collation: Collation,
    },
    FunctionCall {
        function: Arc<FunctionSchema>,
        args: Vec<ScalarPlan>,
    },
    WindowCall {
        /// Per-statement counter identity for the runtime
        id: u64,
        func: WindowFunc,
    },
    Case {
        operand: Option<Box<ScalarPlan>>,
        whens: Vec<(ScalarPlan, ScalarPlan)>,
        else_expr: Option<Box<ScalarPlan>>,
    },
    Cast {
        expr: Box<ScalarPlan>,
        affinity: TypeAffinity,
    },
    Collate {
        expr: Box<ScalarPlan>,
        collation: Collation,
    },
    IsNull {
        expr: Box<ScalarPlan>,
        negated: bool,
    },
    Like {
        expr: Box<ScalarPlan>,
        pattern: Box<ScalarPlan>,
        escape: Option<Box<ScalarPlan>>,
        negated: bool,
    },
    InList {
        expr: Box<ScalarPlan>,
        items: Vec<ScalarPlan>,
        negated: bool,
        collation: Collation,
    },
    InSubquery {
        expr: Box<ScalarPlan>,
        subplan: Arc<RelationalPlan>,
        negated: bool,
        collation: Collation,
    },
    Exists {
        subplan: Arc<RelationalPlan>,
        negated: bool,
    },
    ScalarSubquery {
        subplan: Arc<RelationalPlan>,
    },
}

/// Discriminant used by the emitter registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Literal,
    ColumnRef,
    Parameter,
    Unary,
    Binary,
    FunctionCall,
    WindowCall,
    Case,
    Cast,
    Collate,
    IsNull,
    Like,
    InList,
    InSubquery,
    Exists,
    ScalarSubquery,
}

impl ScalarPlan {
    pub fn literal(value: Value) -> Self {
        ScalarPlan::Literal { value }
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarPlan::Literal { .. } => ScalarKind::Literal,
            ScalarPlan::ColumnRef { .. } => ScalarKind::ColumnRef,
            ScalarPlan::Parameter { .. } => ScalarKind::Parameter,
            ScalarPlan::Unary { .. } => ScalarKind::Unary,
            ScalarPlan::Binary { .. } => ScalarKind::Binary,
            ScalarPlan::FunctionCall { .. } => ScalarKind::FunctionCall,
            ScalarPlan::WindowCall { .. } => ScalarKind::WindowCall,
            ScalarPlan::Case { .. } => ScalarKind::Case,
            ScalarPlan::Cast { .. } => ScalarKind::Cast,
            ScalarPlan::Collate { .. } => ScalarKind::Collate,
            ScalarPlan::IsNull { .. } => ScalarKind::IsNull,
            ScalarPlan::Like { .. } => ScalarKind::Like,
            ScalarPlan::InList { .. } => ScalarKind::InList,
            ScalarPlan::InSubquery { .. } => ScalarKind::InSubquery,
            ScalarPlan::Exists { .. } => ScalarKind::Exists,
            ScalarPlan::ScalarSubquery { .. } => ScalarKind::ScalarSubquery,
        }
    }

    pub fn column(attribute: Attribute) -> Self {
        ScalarPlan::ColumnRef { attribute }
    }

    /// Inferred static type of this expression
    pub fn ty(&self) -> ScalarType {
        match self {
            ScalarPlan::Literal { value } => {
                let affinity = match value {
                    Value::Null => TypeAffinity::Blob,
                    Value::Integer(_) => TypeAffinity::Integer,
                    Value::Real(_) => TypeAffinity::Real,
                    Value::Text(_) => TypeAffinity::Text,
                    Value::Blob(_) => TypeAffinity::Blob,
                };
                ScalarType {
                    affinity,
                    nullable: value.is_null(),
                    collation: Collation::Binary,
                }
            }
            ScalarPlan::ColumnRef { attribute } => attribute.ty,
            ScalarPlan::Parameter { ty, .. } => *ty,
            ScalarPlan::Unary { op, expr } => {
                let inner = expr.ty();
                match op {
                    UnaryOp::Not => ScalarType {
                        affinity: TypeAffinity::Integer,
                        nullable: inner.nullable,
                        collation: Collation::Binary,
                    },
                    UnaryOp::Neg | UnaryOp::Plus => ScalarType {
                        affinity: if inner.affinity == TypeAffinity::Real {
                            TypeAffinity::Real
                        } else {
                            TypeAffinity::Numeric
                        },
                        nullable: inner.nullable,
                        collation: Collation::Binary,
                    },
                }
            }
            ScalarPlan::Binary {
                op, left, right, ..
            } => {
                let (lt, rt) = (left.ty(), right.ty());
                let nullable = match op {
                    BinaryOp::Is | BinaryOp::IsNot => false,
                    _ => lt.nullable || rt.nullable,
                };
                let affinity = match op {
                    BinaryOp::Concat => TypeAffinity::Text,
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod => {
                        if lt.affinity == TypeAffinity::Real || rt.affinity == TypeAffinity::Real {
                            TypeAffinity::Real
                        } else {
                            TypeAffinity::Numeric
                        }
                    }
                    BinaryOp::Div => TypeAffinity::Numeric,
                    _ => TypeAffinity::Integer,
                };
                ScalarType {
                    affinity,
                    nullable,
                    collation: Collation::Binary,
                }
            }
            ScalarPlan::FunctionCall { function, args } => {
                // Builtins keep NULL-in/NULL-out typing except the
                // NULL-handling family
                let nullable = match function.name.to_ascii_lowercase().as_str() {
                    "coalesce" | "ifnull" => args.iter().all(|a| a.ty().nullable),
                    _ => true,
                };
                ScalarType {
                    affinity: TypeAffinity::Numeric,
                    nullable,
                    collation: Collation::Binary,
                }
            }
            ScalarPlan::WindowCall { .. } => ScalarType::integer().not_null(),
            ScalarPlan::Case {
                whens, else_expr, ..
            } => {
                let mut affinity = None;
                let mut nullable = else_expr.is_none();
                for (_, then) in whens {
                    let t = then.ty();
                    affinity.get_or_insert(t.affinity);
                    nullable |= t.nullable;
                }
                if let Some(e) = else_expr {
                    nullable |= e.ty().nullable;
                }
                ScalarType {
                    affinity: affinity.unwrap_or(TypeAffinity::Blob),
                    nullable,
                    collation: Collation::Binary,
                }
            }
            ScalarPlan::Cast { expr, affinity } => ScalarType {
                affinity: *affinity,
                nullable: expr.ty().nullable,
                collation: Collation::Binary,
            },
            ScalarPlan::Collate { expr, collation } => expr.ty().with_collation(*collation),
            ScalarPlan::IsNull { .. } => ScalarType::integer().not_null(),
            ScalarPlan::Like { expr, pattern, .. } => ScalarType {
                affinity: TypeAffinity::Integer,
                nullable: expr.ty().nullable || pattern.ty().nullable,
                collation: Collation::Binary,
            },
            ScalarPlan::InList { expr, .. } | ScalarPlan::InSubquery { expr, .. } => ScalarType {
                affinity: TypeAffinity::Integer,
                nullable: expr.ty().nullable,
                collation: Collation::Binary,
            },
            ScalarPlan::Exists { .. } => ScalarType::integer().not_null(),
            ScalarPlan::ScalarSubquery { subplan } => subplan
                .attributes()
                .first()
                .map_or(ScalarType::numeric(), |a| {
                    let mut ty = a.ty;
                    // Empty result yields NULL
                    ty.nullable = true;
                    ty
                }),
        }
    }

    /// Collation governing comparisons of this expression, following
    /// the explicit-COLLATE-wins rule
    pub fn comparison_collation(&self) -> Collation {
        match self {
            ScalarPlan::Collate { collation, .. } => *collation,
            ScalarPlan::ColumnRef { attribute } => attribute.ty.collation,
            ScalarPlan::Cast { expr, .. } | ScalarPlan::Unary { expr, .. } => {
                expr.comparison_collation()
            }
            _ => Collation::Binary,
        }
    }

    /// All attribute ids this expression reads
    pub fn referenced_attributes(&self) -> Vec<super::AttributeId> {
        let mut ids = Vec::new();
        self.collect_attributes(&mut ids);
        ids
    }

    fn collect_attributes(&self, ids: &mut Vec<super::AttributeId>) {
        match self {
            ScalarPlan::ColumnRef { attribute } => ids.push(attribute.id),
            ScalarPlan::Unary { expr, .. }
            | ScalarPlan::Cast { expr, .. }
            | ScalarPlan::Collate { expr, .. }
            | ScalarPlan::IsNull { expr, .. } => expr.collect_attributes(ids),
            ScalarPlan::Binary { left, right, .. } => {
                left.collect_attributes(ids);
                right.collect_attributes(ids);
            }
            ScalarPlan::FunctionCall { args, .. } => {
                for arg in args {
                    arg.collect_attributes(ids);
                }
            }
            ScalarPlan::Case {
                operand,
                whens,
                else_expr,
            } => {
                if let Some(op) = operand {
                    op.collect_attributes(ids);
                }
                for (when, then) in whens {
                    when.collect_attributes(ids);
                    then.collect_attributes(ids);
                }
                if let Some(e) = else_expr {
                    e.collect_attributes(ids);
                }
            }
            ScalarPlan::Like {
                expr,
                pattern,
                escape,
                ..
            } => {
                expr.collect_attributes(ids);
                pattern.collect_attributes(ids);
                if let Some(e) = escape {
                    e.collect_attributes(ids);
                }
            }
            ScalarPlan::InList { expr, items, .. } => {
                expr.collect_attributes(ids);
                for item in items {
                    item.collect_attributes(ids);
                }
            }
            ScalarPlan::InSubquery { expr, .. } => expr.collect_attributes(ids),
            ScalarPlan::Literal { .. }
            | ScalarPlan::Parameter { .. }
            | ScalarPlan::WindowCall { .. }
            | ScalarPlan::Exists { .. }
            | ScalarPlan::ScalarSubquery { .. } => {}
        }
    }

    /// Whether this expression contains a subquery. Subquery results
    /// may depend on outer row slots, so they never qualify as scan
    /// arguments resolvable at statement start.
    pub fn contains_subquery(&self) -> bool {
        match self {
            ScalarPlan::InSubquery { .. }
            | ScalarPlan::Exists { .. }
            | ScalarPlan::ScalarSubquery { .. } => true,
            ScalarPlan::Unary { expr, .. }
            | ScalarPlan::Cast { expr, .. }
            | ScalarPlan::Collate { expr, .. }
            | ScalarPlan::IsNull { expr, .. } => expr.contains_subquery(),
            ScalarPlan::Binary { left, right, .. } => {
                left.contains_subquery() || right.contains_subquery()
            }
            ScalarPlan::FunctionCall { args, .. } => {
                args.iter().any(ScalarPlan::contains_subquery)
            }
            ScalarPlan::Case {
                operand,
                whens,
                else_expr,
            } => {
                operand.as_deref().is_some_and(ScalarPlan::contains_subquery)
                    || whens
                        .iter()
                        .any(|(w, t)| w.contains_subquery() || t.contains_subquery())
                    || else_expr.as_deref().is_some_and(ScalarPlan::contains_subquery)
            }
            ScalarPlan::Like {
                expr,
                pattern,
                escape,
                ..
            } => {
                expr.contains_subquery()
                    || pattern.contains_subquery()
                    || escape.as_deref().is_some_and(ScalarPlan::contains_subquery)
            }
            ScalarPlan::InList { expr, items, .. } => {
                expr.contains_subquery() || items.iter().any(ScalarPlan::contains_subquery)
            }
            ScalarPlan::Literal { .. }
            | ScalarPlan::ColumnRef { .. }
            | ScalarPlan::Parameter { .. }
            | ScalarPlan::WindowCall { .. } => false,
        }
    }

    /// Split a conjunction into its AND-ed conjuncts
    pub fn conjuncts(self) -> Vec<ScalarPlan> {
        match self {
            ScalarPlan::Binary {
                op: BinaryOp::And,
                left,
                right,
                ..
            } => {
                let mut parts = left.conjuncts();
                parts.extend(right.conjuncts());
                parts
            }
            other => vec![other],
        }
    }
}

impl fmt::Display for ScalarPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarPlan::Literal { value } => write!(f, "{value}"),
            ScalarPlan::ColumnRef { attribute } => {
                write!(f, "{}#{}", attribute.name, attribute.id)
            }
            ScalarPlan::Parameter { param, .. } => match param {
                ParamRef::Positional(i) => write!(f, "?{i}"),
                ParamRef::Named(n) => write!(f, ":{n}"),
            },
            ScalarPlan::Unary { op, expr } => write!(f, "{op:?}({expr})"),
            ScalarPlan::Binary { op, left, right, .. } => {
                write!(f, "({left} {op:?} {right})")
            }
            ScalarPlan::FunctionCall { function, args } => {
                write!(f, "{}(", function.name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ScalarPlan::WindowCall { func, .. } => write!(f, "{func:?}() over ()"),
            ScalarPlan::Case { .. } => write!(f, "case"),
            ScalarPlan::Cast { expr, affinity } => write!(f, "cast({expr} as {affinity:?})"),
            ScalarPlan::Collate { expr, collation } => {
                write!(f, "({expr} collate {collation:?})")
            }
            ScalarPlan::IsNull { expr, negated } => {
                write!(f, "({expr} is {}null)", if *negated { "not " } else { "" })
            }
            ScalarPlan::Like { expr, pattern, negated, .. } => {
                write!(f, "({expr} {}like {pattern})", if *negated { "not " } else { "" })
            }
            ScalarPlan::InList { expr, items, .. } => {
                write!(f, "({expr} in [{} items])", items.len())
            }
            ScalarPlan::InSubquery { expr, .. } => write!(f, "({expr} in <subquery>)"),
            ScalarPlan::Exists { negated, .. } => {
                write!(f, "{}exists(<subquery>)", if *negated { "not " } else { "" })
            }
            ScalarPlan::ScalarSubquery { .. } => write!(f, "<scalar subquery>"),
        }
    }
}

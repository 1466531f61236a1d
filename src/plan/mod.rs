//! # Plan IR
//!
//! Typed trees of plan nodes produced by the planner and lowered by the
//! emitter. Three disjoint node kinds exist: relational nodes produce
//! rows, scalar nodes produce one value per invocation in some row
//! context, and sink nodes produce nothing (DDL, transaction control).
//!
//! Every relational node exposes a list of [`Attribute`]s. Attribute ids
//! are process-unique and are the sole basis for column resolution;
//! names are advisory. Plan nodes are immutable after construction and
//! live for one statement; children are shared via `Arc`.

mod relational;
mod scalar;
mod sink;

pub use relational::*;
pub use scalar::*;
pub use sink::*;

use crate::value::{Collation, TypeAffinity};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a plan node within the process
pub type PlanNodeId = u64;

/// Identity of an attribute within the process
pub type AttributeId = u64;

static NEXT_PLAN_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ATTRIBUTE_ID: AtomicU64 = AtomicU64::new(1);

/// Issue a fresh plan-node id
pub fn next_plan_node_id() -> PlanNodeId {
    NEXT_PLAN_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Issue a fresh attribute id
pub fn next_attribute_id() -> AttributeId {
    NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Static type of a scalar expression or column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalarType {
    pub affinity: TypeAffinity,
    pub nullable: bool,
    pub collation: Collation,
}

impl ScalarType {
    pub fn new(affinity: TypeAffinity) -> Self {
        ScalarType {
            affinity,
            nullable: true,
            collation: Collation::Binary,
        }
    }

    pub fn integer() -> Self {
        ScalarType::new(TypeAffinity::Integer)
    }

    pub fn real() -> Self {
        ScalarType::new(TypeAffinity::Real)
    }

    pub fn text() -> Self {
        ScalarType::new(TypeAffinity::Text)
    }

    pub fn numeric() -> Self {
        ScalarType::new(TypeAffinity::Numeric)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }
}

/// A named, typed output column of a relational node.
///
/// The `source` back-reference identifies the node that introduced the
/// attribute; runtime column lookup goes through the row slot of the
/// node a consumer registered, not through this pointer.
#[derive(Debug, Clone, Serialize)]
pub struct Attribute {
    pub id: AttributeId,
    pub name: String,
    pub ty: ScalarType,
    pub source: PlanNodeId,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: ScalarType, source: PlanNodeId) -> Self {
        Attribute {
            id: next_attribute_id(),
            name: name.into(),
            ty,
            source,
        }
    }

    /// Copy this attribute under a new producing node, keeping its id
    /// (used by pass-through nodes such as joins and filters)
    pub fn carried_by(&self, source: PlanNodeId) -> Attribute {
        Attribute {
            id: self.id,
            name: self.name.clone(),
            ty: self.ty,
            source,
        }
    }

    /// Copy with nullability forced on (outer-join padding)
    pub fn nullable(&self) -> Attribute {
        let mut attr = self.clone();
        attr.ty.nullable = true;
        attr
    }
}

/// One output column of a [`RelationType`]
#[derive(Debug, Clone, Serialize)]
pub struct RelColumn {
    pub name: String,
    pub ty: ScalarType,
    pub hidden: bool,
}

/// Shape of the row set a relational node produces
#[derive(Debug, Clone, Serialize)]
pub struct RelationType {
    pub columns: Vec<RelColumn>,
    /// Sets of column indices guaranteed unique (superkeys of the output)
    pub keys: Vec<Vec<usize>>,
    pub read_only: bool,
    /// CHECK constraint sources carried from the table definition
    pub row_constraints: Vec<String>,
}

impl RelationType {
    pub fn from_attributes(attributes: &[Attribute]) -> Self {
        RelationType {
            columns: attributes
                .iter()
                .map(|a| RelColumn {
                    name: a.name.clone(),
                    ty: a.ty,
                    hidden: false,
                })
                .collect(),
            keys: Vec::new(),
            read_only: true,
            row_constraints: Vec::new(),
        }
    }
}

/// Row-mutation operations flowing through the DML pipeline and into
/// virtual tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationOp::Insert => "insert",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A statement-level plan: either a row-producing tree or a sink
#[derive(Debug, Clone)]
pub enum PlanNode {
    Relational(Arc<RelationalPlan>),
    Sink(Arc<SinkPlan>),
}

impl PlanNode {
    pub fn as_relational(&self) -> Option<&Arc<RelationalPlan>> {
        match self {
            PlanNode::Relational(plan) => Some(plan),
            PlanNode::Sink(_) => None,
        }
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, PlanNode::Sink(_))
    }

    /// One-line-per-node tree rendering for logs and the shell
    pub fn explain(&self) -> String {
        match self {
            PlanNode::Relational(plan) => plan.explain(0),
            PlanNode::Sink(sink) => format!("{sink}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generators_are_monotonic() {
        let a = next_attribute_id();
        let b = next_attribute_id();
        assert!(b > a);
        let n1 = next_plan_node_id();
        let n2 = next_plan_node_id();
        assert!(n2 > n1);
    }

    #[test]
    fn test_attribute_identity_preserved_by_carry() {
        let attr = Attribute::new("x", ScalarType::integer(), 1);
        let carried = attr.carried_by(2);
        assert_eq!(attr.id, carried.id);
        assert_eq!(carried.source, 2);
    }

    #[test]
    fn test_nullable_copy_keeps_id() {
        let attr = Attribute::new("x", ScalarType::integer().not_null(), 1);
        assert!(!attr.ty.nullable);
        let padded = attr.nullable();
        assert!(padded.ty.nullable);
        assert_eq!(padded.id, attr.id);
    }
}

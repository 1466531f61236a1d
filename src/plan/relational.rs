//! Relational plan nodes.
//!
//! Row-producing operators. Pass-through nodes (Filter, Sort, Distinct,
//! LimitOffset) re-expose their source's attributes under the same ids;
//! projection-like nodes (Project, Aggregate, Values, Cte) introduce
//! fresh attributes. The `Retrieve` node is the virtual-table boundary:
//! every base table reference is wrapped in one, and push-down replaces
//! the wrapped pipeline with a `RemoteQuery` carrying the module's
//! context plus the original subtree as a fallback descriptor.

use super::{
    next_plan_node_id, Attribute, MutationOp, PlanNode, PlanNodeId, RelationType, ScalarPlan,
};
use crate::schema::{IndexSchema, TableSchema, DEFAULT_ROW_ESTIMATE};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Comparison operators a module can consume through `best_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A predicate the planner hands to the virtual table instead of
/// evaluating in a Filter node
#[derive(Debug, Clone)]
pub struct PushedConstraint {
    /// Table column index the constraint applies to
    pub column: usize,
    pub op: ConstraintOp,
    /// Evaluated at statement start; parameters allowed
    pub value: ScalarPlan,
}

/// Base-table reference resolved at build time. Never appears bare in a
/// tree; construction always wraps it in a [`RetrieveNode`].
#[derive(Debug, Clone)]
pub struct TableRef {
    pub table: Arc<TableSchema>,
    /// Name the table is visible under in the query (alias or table name)
    pub binding: String,
}

/// The one-empty-row source for FROM-less SELECTs
#[derive(Debug)]
pub struct SingleRowNode {
    pub id: PlanNodeId,
}

/// Literal rows
#[derive(Debug)]
pub struct ValuesNode {
    pub id: PlanNodeId,
    pub rows: Vec<Vec<ScalarPlan>>,
    pub attributes: Vec<Attribute>,
}

/// Virtual-table boundary: a scan of a base table, optionally through a
/// secondary index, with constraints the module agreed to handle
#[derive(Debug)]
pub struct RetrieveNode {
    pub id: PlanNodeId,
    pub table_ref: TableRef,
    /// Access path chosen by `best_index`; `None` scans the primary key
    pub index: Option<Arc<IndexSchema>>,
    pub pushdown: Vec<PushedConstraint>,
    pub attributes: Vec<Attribute>,
    pub relation_type: RelationType,
}

/// A pipeline accepted for push-down by the module's `supports` probe
pub struct RemoteQueryNode {
    pub id: PlanNodeId,
    pub table: Arc<TableSchema>,
    /// Original subtree, kept as the fallback descriptor
    pub fallback: Arc<RelationalPlan>,
    /// Opaque module context returned by `supports`
    pub ctx: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for RemoteQueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteQueryNode")
            .field("id", &self.id)
            .field("table", &self.table.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ProjectNode {
    pub id: PlanNodeId,
    pub source: Arc<RelationalPlan>,
    pub exprs: Vec<ScalarPlan>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug)]
pub struct FilterNode {
    pub id: PlanNodeId,
    pub source: Arc<RelationalPlan>,
    pub predicate: ScalarPlan,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    Cross,
}

#[derive(Debug)]
pub struct JoinNode {
    pub id: PlanNodeId,
    pub left: Arc<RelationalPlan>,
    pub right: Arc<RelationalPlan>,
    pub kind: JoinKind,
    pub on: Option<ScalarPlan>,
    /// Left attributes then right attributes (right side forced
    /// nullable for outer joins), all carried under this node
    pub attributes: Vec<Attribute>,
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Total,
}

impl AggFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "total" => Some(AggFunc::Total),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct AggregateExpr {
    pub func: AggFunc,
    /// `None` for `count(*)`
    pub arg: Option<ScalarPlan>,
    pub distinct: bool,
}

#[derive(Debug)]
pub struct AggregateNode {
    pub id: PlanNodeId,
    pub source: Arc<RelationalPlan>,
    pub group_by: Vec<ScalarPlan>,
    pub aggregates: Vec<AggregateExpr>,
    /// Group columns first, then one attribute per aggregate
    pub attributes: Vec<Attribute>,
}

#[derive(Debug)]
pub struct SortSpec {
    pub expr: ScalarPlan,
    pub desc: bool,
}

#[derive(Debug)]
pub struct SortNode {
    pub id: PlanNodeId,
    pub source: Arc<RelationalPlan>,
    pub keys: Vec<SortSpec>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug)]
pub struct DistinctNode {
    pub id: PlanNodeId,
    pub source: Arc<RelationalPlan>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug)]
pub struct LimitOffsetNode {
    pub id: PlanNodeId,
    pub source: Arc<RelationalPlan>,
    pub limit: Option<ScalarPlan>,
    pub offset: Option<ScalarPlan>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug)]
pub struct UnionAllNode {
    pub id: PlanNodeId,
    pub left: Arc<RelationalPlan>,
    pub right: Arc<RelationalPlan>,
    pub attributes: Vec<Attribute>,
}

/// A WITH-clause subquery reference
#[derive(Debug)]
pub struct CteNode {
    pub id: PlanNodeId,
    pub name: String,
    pub source: Arc<RelationalPlan>,
    /// Buffer the source before yielding instead of streaming through
    pub materialized: bool,
    pub attributes: Vec<Attribute>,
}

/// Produces the full-width rows an INSERT will write
#[derive(Debug)]
pub struct InsertNode {
    pub id: PlanNodeId,
    pub table: Arc<TableSchema>,
    pub source: Arc<RelationalPlan>,
    /// One expression per table column, in column order, over the
    /// source's attributes (defaults filled in for omitted columns)
    pub column_exprs: Vec<ScalarPlan>,
    pub attributes: Vec<Attribute>,
}

/// Produces updated rows carrying the original key in the row sidecar
#[derive(Debug)]
pub struct UpdateNode {
    pub id: PlanNodeId,
    pub table: Arc<TableSchema>,
    pub source: Arc<RelationalPlan>,
    /// One expression per table column: the assignment or the old value
    pub column_exprs: Vec<ScalarPlan>,
    pub attributes: Vec<Attribute>,
}

/// Passes doomed rows through, attaching their key to the row sidecar
#[derive(Debug)]
pub struct DeleteNode {
    pub id: PlanNodeId,
    pub table: Arc<TableSchema>,
    pub source: Arc<RelationalPlan>,
    pub attributes: Vec<Attribute>,
}

/// Validates NOT NULL and CHECK constraints before any mutation runs
#[derive(Debug)]
pub struct ConstraintCheckNode {
    pub id: PlanNodeId,
    pub table: Arc<TableSchema>,
    pub source: Arc<RelationalPlan>,
    pub op: MutationOp,
    /// Compiled CHECK expressions over the source's attributes
    pub checks: Vec<ScalarPlan>,
    pub attributes: Vec<Attribute>,
}

/// Applies the mutation to the virtual table; produces no rows
#[derive(Debug)]
pub struct DmlExecutorNode {
    pub id: PlanNodeId,
    pub table: Arc<TableSchema>,
    pub source: Arc<RelationalPlan>,
    pub op: MutationOp,
}

/// A nestable statement sequence whose value is the last non-sink
/// statement's output
#[derive(Debug)]
pub struct BlockNode {
    pub id: PlanNodeId,
    pub statements: Vec<PlanNode>,
    pub attributes: Vec<Attribute>,
}

/// A row-producing plan node
#[derive(Debug)]
pub enum RelationalPlan {
    SingleRow(SingleRowNode),
    Values(ValuesNode),
    Retrieve(RetrieveNode),
    RemoteQuery(RemoteQueryNode),
    Project(ProjectNode),
    Filter(FilterNode),
    Join(JoinNode),
    Aggregate(AggregateNode),
    Sort(SortNode),
    Distinct(DistinctNode),
    LimitOffset(LimitOffsetNode),
    UnionAll(UnionAllNode),
    Cte(CteNode),
    Insert(InsertNode),
    Update(UpdateNode),
    Delete(DeleteNode),
    ConstraintCheck(ConstraintCheckNode),
    DmlExecutor(DmlExecutorNode),
    Block(BlockNode),
}

/// Discriminant used by the emitter registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationalKind {
    SingleRow,
    Values,
    Retrieve,
    RemoteQuery,
    Project,
    Filter,
    Join,
    Aggregate,
    Sort,
    Distinct,
    LimitOffset,
    UnionAll,
    Cte,
    Insert,
    Update,
    Delete,
    ConstraintCheck,
    DmlExecutor,
    Block,
}

static SINGLE_ROW: LazyLock<Arc<RelationalPlan>> = LazyLock::new(|| {
    Arc::new(RelationalPlan::SingleRow(SingleRowNode {
        id: next_plan_node_id(),
    }))
});

impl RelationalPlan {
    /// The process-wide FROM-less SELECT source
    pub fn single_row() -> Arc<RelationalPlan> {
        Arc::clone(&SINGLE_ROW)
    }

    pub fn id(&self) -> PlanNodeId {
        match self {
            RelationalPlan::SingleRow(n) => n.id,
            RelationalPlan::Values(n) => n.id,
            RelationalPlan::Retrieve(n) => n.id,
            RelationalPlan::RemoteQuery(n) => n.id,
            RelationalPlan::Project(n) => n.id,
            RelationalPlan::Filter(n) => n.id,
            RelationalPlan::Join(n) => n.id,
            RelationalPlan::Aggregate(n) => n.id,
            RelationalPlan::Sort(n) => n.id,
            RelationalPlan::Distinct(n) => n.id,
            RelationalPlan::LimitOffset(n) => n.id,
            RelationalPlan::UnionAll(n) => n.id,
            RelationalPlan::Cte(n) => n.id,
            RelationalPlan::Insert(n) => n.id,
            RelationalPlan::Update(n) => n.id,
            RelationalPlan::Delete(n) => n.id,
            RelationalPlan::ConstraintCheck(n) => n.id,
            RelationalPlan::DmlExecutor(n) => n.id,
            RelationalPlan::Block(n) => n.id,
        }
    }

    pub fn kind(&self) -> RelationalKind {
        match self {
            RelationalPlan::SingleRow(_) => RelationalKind::SingleRow,
            RelationalPlan::Values(_) => RelationalKind::Values,
            RelationalPlan::Retrieve(_) => RelationalKind::Retrieve,
            RelationalPlan::RemoteQuery(_) => RelationalKind::RemoteQuery,
            RelationalPlan::Project(_) => RelationalKind::Project,
            RelationalPlan::Filter(_) => RelationalKind::Filter,
            RelationalPlan::Join(_) => RelationalKind::Join,
            RelationalPlan::Aggregate(_) => RelationalKind::Aggregate,
            RelationalPlan::Sort(_) => RelationalKind::Sort,
            RelationalPlan::Distinct(_) => RelationalKind::Distinct,
            RelationalPlan::LimitOffset(_) => RelationalKind::LimitOffset,
            RelationalPlan::UnionAll(_) => RelationalKind::UnionAll,
            RelationalPlan::Cte(_) => RelationalKind::Cte,
            RelationalPlan::Insert(_) => RelationalKind::Insert,
            RelationalPlan::Update(_) => RelationalKind::Update,
            RelationalPlan::Delete(_) => RelationalKind::Delete,
            RelationalPlan::ConstraintCheck(_) => RelationalKind::ConstraintCheck,
            RelationalPlan::DmlExecutor(_) => RelationalKind::DmlExecutor,
            RelationalPlan::Block(_) => RelationalKind::Block,
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        static EMPTY: [Attribute; 0] = [];
        match self {
            RelationalPlan::SingleRow(_) => &EMPTY,
            RelationalPlan::Values(n) => &n.attributes,
            RelationalPlan::Retrieve(n) => &n.attributes,
            RelationalPlan::RemoteQuery(n) => n.fallback.attributes(),
            RelationalPlan::Project(n) => &n.attributes,
            RelationalPlan::Filter(n) => &n.attributes,
            RelationalPlan::Join(n) => &n.attributes,
            RelationalPlan::Aggregate(n) => &n.attributes,
            RelationalPlan::Sort(n) => &n.attributes,
            RelationalPlan::Distinct(n) => &n.attributes,
            RelationalPlan::LimitOffset(n) => &n.attributes,
            RelationalPlan::UnionAll(n) => &n.attributes,
            RelationalPlan::Cte(n) => &n.attributes,
            RelationalPlan::Insert(n) => &n.attributes,
            RelationalPlan::Update(n) => &n.attributes,
            RelationalPlan::Delete(n) => &n.attributes,
            RelationalPlan::ConstraintCheck(n) => &n.attributes,
            RelationalPlan::DmlExecutor(_) => &EMPTY,
            RelationalPlan::Block(n) => &n.attributes,
        }
    }

    pub fn arity(&self) -> usize {
        self.attributes().len()
    }

    /// Declared shape of the produced rows
    pub fn relation_type(&self) -> RelationType {
        match self {
            RelationalPlan::Retrieve(n) => n.relation_type.clone(),
            other => RelationType::from_attributes(other.attributes()),
        }
    }

    /// Heuristic output-cardinality estimate
    pub fn estimated_rows(&self) -> f64 {
        match self {
            RelationalPlan::SingleRow(_) => 1.0,
            RelationalPlan::Values(n) => n.rows.len() as f64,
            RelationalPlan::Retrieve(n) => {
                let base = n.table_ref.table.estimated_rows().max(1) as f64;
                if n.pushdown.iter().any(|c| c.op == ConstraintOp::Eq) {
                    // Point or prefix lookup
                    (base / DEFAULT_ROW_ESTIMATE as f64).max(1.0)
                } else if n.pushdown.is_empty() {
                    base
                } else {
                    base / 3.0
                }
            }
            RelationalPlan::RemoteQuery(n) => n.fallback.estimated_rows(),
            RelationalPlan::Project(n) => n.source.estimated_rows(),
            RelationalPlan::Filter(n) => (n.source.estimated_rows() / 3.0).max(1.0),
            RelationalPlan::Join(n) => {
                let cardinality = n.left.estimated_rows() * n.right.estimated_rows();
                if n.on.is_some() {
                    (cardinality / 3.0).max(1.0)
                } else {
                    cardinality
                }
            }
            RelationalPlan::Aggregate(n) => {
                if n.group_by.is_empty() {
                    1.0
                } else {
                    (n.source.estimated_rows() / 10.0).max(1.0)
                }
            }
            RelationalPlan::Sort(n) => n.source.estimated_rows(),
            RelationalPlan::Distinct(n) => (n.source.estimated_rows() / 2.0).max(1.0),
            RelationalPlan::LimitOffset(n) => n.source.estimated_rows(),
            RelationalPlan::UnionAll(n) => n.left.estimated_rows() + n.right.estimated_rows(),
            RelationalPlan::Cte(n) => n.source.estimated_rows(),
            RelationalPlan::Insert(n) => n.source.estimated_rows(),
            RelationalPlan::Update(n) => n.source.estimated_rows(),
            RelationalPlan::Delete(n) => n.source.estimated_rows(),
            RelationalPlan::ConstraintCheck(n) => n.source.estimated_rows(),
            RelationalPlan::DmlExecutor(_) | RelationalPlan::Block(_) => 0.0,
        }
    }

    /// Heuristic total cost: own output plus children
    pub fn estimated_cost(&self) -> f64 {
        let children: f64 = self.children().iter().map(|c| c.estimated_cost()).sum();
        children + self.estimated_rows()
    }

    /// Structural children (input relations)
    pub fn children(&self) -> Vec<&Arc<RelationalPlan>> {
        match self {
            RelationalPlan::SingleRow(_)
            | RelationalPlan::Values(_)
            | RelationalPlan::Retrieve(_) => Vec::new(),
            RelationalPlan::RemoteQuery(n) => vec![&n.fallback],
            RelationalPlan::Project(n) => vec![&n.source],
            RelationalPlan::Filter(n) => vec![&n.source],
            RelationalPlan::Join(n) => vec![&n.left, &n.right],
            RelationalPlan::Aggregate(n) => vec![&n.source],
            RelationalPlan::Sort(n) => vec![&n.source],
            RelationalPlan::Distinct(n) => vec![&n.source],
            RelationalPlan::LimitOffset(n) => vec![&n.source],
            RelationalPlan::UnionAll(n) => vec![&n.left, &n.right],
            RelationalPlan::Cte(n) => vec![&n.source],
            RelationalPlan::Insert(n) => vec![&n.source],
            RelationalPlan::Update(n) => vec![&n.source],
            RelationalPlan::Delete(n) => vec![&n.source],
            RelationalPlan::ConstraintCheck(n) => vec![&n.source],
            RelationalPlan::DmlExecutor(n) => vec![&n.source],
            RelationalPlan::Block(n) => n
                .statements
                .iter()
                .filter_map(PlanNode::as_relational)
                .collect(),
        }
    }

    /// Stable one-line summary used for logging and plan printing
    pub fn summary(&self) -> String {
        match self {
            RelationalPlan::SingleRow(_) => "SingleRow".to_string(),
            RelationalPlan::Values(n) => {
                format!("Values({} rows, {} cols)", n.rows.len(), n.attributes.len())
            }
            RelationalPlan::Retrieve(n) => {
                let access = n
                    .index
                    .as_ref()
                    .map_or_else(|| "pk".to_string(), |i| format!("index {}", i.name));
                format!(
                    "Retrieve({} via {access}, {} pushed)",
                    n.table_ref.table.name,
                    n.pushdown.len()
                )
            }
            RelationalPlan::RemoteQuery(n) => format!("RemoteQuery({})", n.table.name),
            RelationalPlan::Project(n) => format!("Project({} cols)", n.exprs.len()),
            RelationalPlan::Filter(n) => format!("Filter({})", n.predicate),
            RelationalPlan::Join(n) => format!("Join({:?})", n.kind),
            RelationalPlan::Aggregate(n) => format!(
                "Aggregate(group={}, aggs={})",
                n.group_by.len(),
                n.aggregates.len()
            ),
            RelationalPlan::Sort(n) => format!("Sort({} keys)", n.keys.len()),
            RelationalPlan::Distinct(_) => "Distinct".to_string(),
            RelationalPlan::LimitOffset(n) => format!(
                "LimitOffset(limit={}, offset={})",
                n.limit.is_some(),
                n.offset.is_some()
            ),
            RelationalPlan::UnionAll(_) => "UnionAll".to_string(),
            RelationalPlan::Cte(n) => format!(
                "Cte({}{})",
                n.name,
                if n.materialized { ", materialized" } else { "" }
            ),
            RelationalPlan::Insert(n) => format!("Insert({})", n.table.name),
            RelationalPlan::Update(n) => format!("Update({})", n.table.name),
            RelationalPlan::Delete(n) => format!("Delete({})", n.table.name),
            RelationalPlan::ConstraintCheck(n) => {
                format!("ConstraintCheck({}, {})", n.table.name, n.op)
            }
            RelationalPlan::DmlExecutor(n) => format!("DmlExecutor({}, {})", n.table.name, n.op),
            RelationalPlan::Block(n) => format!("Block({} statements)", n.statements.len()),
        }
    }

    /// Indented tree rendering
    pub fn explain(&self, indent: usize) -> String {
        let mut out = format!("{}{}", "  ".repeat(indent), self.summary());
        for child in self.children() {
            out.push('\n');
            out.push_str(&child.explain(indent + 1));
        }
        out
    }
}

impl fmt::Display for RelationalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ScalarType;
    use crate::value::Value;

    fn values_node(rows: usize) -> Arc<RelationalPlan> {
        let id = next_plan_node_id();
        Arc::new(RelationalPlan::Values(ValuesNode {
            id,
            rows: (0..rows)
                .map(|i| vec![ScalarPlan::literal(Value::Integer(i as i64))])
                .collect(),
            attributes: vec![Attribute::new("column1", ScalarType::integer(), id)],
        }))
    }

    #[test]
    fn test_single_row_is_singleton() {
        let a = RelationalPlan::single_row();
        let b = RelationalPlan::single_row();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.arity(), 0);
        assert_eq!(a.estimated_rows(), 1.0);
    }

    #[test]
    fn test_pass_through_attributes_share_ids() {
        let source = values_node(3);
        let attrs: Vec<Attribute> = source.attributes().to_vec();
        let filter_id = next_plan_node_id();
        let filter = RelationalPlan::Filter(FilterNode {
            id: filter_id,
            predicate: ScalarPlan::literal(Value::Integer(1)),
            attributes: attrs.iter().map(|a| a.carried_by(filter_id)).collect(),
            source: Arc::clone(&source),
        });
        assert_eq!(filter.attributes()[0].id, source.attributes()[0].id);
    }

    #[test]
    fn test_aggregate_without_groups_estimates_one_row() {
        let source = values_node(100);
        let agg = RelationalPlan::Aggregate(AggregateNode {
            id: next_plan_node_id(),
            source,
            group_by: vec![],
            aggregates: vec![],
            attributes: vec![],
        });
        assert_eq!(agg.estimated_rows(), 1.0);
    }

    #[test]
    fn test_explain_tree_shape() {
        let source = values_node(2);
        let distinct = RelationalPlan::Distinct(DistinctNode {
            id: next_plan_node_id(),
            attributes: source.attributes().to_vec(),
            source,
        });
        let text = distinct.explain(0);
        assert!(text.starts_with("Distinct"));
        assert!(text.contains("\n  Values"));
    }
}

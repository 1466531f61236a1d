//! DML planning.
//!
//! INSERT/UPDATE/DELETE build a producer pipeline over the target
//! table: a source of full-width rows (with the original primary key
//! carried in the row sidecar for UPDATE/DELETE), a constraint-check
//! node validating NOT NULL and CHECK constraints before any mutation
//! runs, and an executor node that applies the rows through the
//! virtual-table contract.

use super::{table_attributes, Planner, RelationBinding, Scope};
use crate::ast::{DeleteStmt, Expr, InsertSource, InsertStmt, UpdateStmt};
use crate::error::{QuereusError, Result, StatusCode};
use crate::plan::{
    next_plan_node_id, Attribute, ConstraintCheckNode, DeleteNode, DmlExecutorNode, InsertNode,
    MutationOp, RelationalPlan, ScalarPlan, ScalarType, UpdateNode,
};
use crate::schema::TableSchema;
use crate::value::Value;
use std::sync::Arc;

impl<'s> Planner<'s> {
    pub(crate) fn build_insert(&mut self, insert: &InsertStmt) -> Result<Arc<RelationalPlan>> {
        let table = self.session().schema.read().require_table(&insert.table)?;
        require_writable(&table)?;

        let provided: Vec<usize> = match &insert.columns {
            Some(names) => {
                let mut indices = Vec::with_capacity(names.len());
                for name in names {
                    let position = table.column_index(name).ok_or_else(|| {
                        QuereusError::not_found(format!(
                            "table '{}' has no column named {name}",
                            table.name
                        ))
                    })?;
                    if indices.contains(&position) {
                        return Err(QuereusError::misuse(format!(
                            "column '{name}' specified more than once"
                        )));
                    }
                    indices.push(position);
                }
                indices
            }
            None => (0..table.columns.len()).collect(),
        };

        let root = Scope::root();
        let source = match &insert.source {
            InsertSource::Values(rows) => self.build_values(rows, &root)?,
            InsertSource::Select(select) => self.build_select(select, &root)?,
        };
        if source.arity() != provided.len() {
            return Err(QuereusError::mismatch(format!(
                "{} values supplied for {} columns of '{}'",
                source.arity(),
                provided.len(),
                table.name
            )));
        }

        let insert_id = next_plan_node_id();
        let column_exprs: Vec<ScalarPlan> = table
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                if let Some(position) = provided.iter().position(|&p| p == index) {
                    ScalarPlan::column(source.attributes()[position].clone())
                } else if let Some(default) = &column.default_value {
                    ScalarPlan::literal(default.clone())
                } else {
                    ScalarPlan::literal(Value::Null)
                }
            })
            .collect();
        let attributes = mutation_attributes(&table, insert_id);
        let producer = Arc::new(RelationalPlan::Insert(InsertNode {
            id: insert_id,
            table: Arc::clone(&table),
            source,
            column_exprs,
            attributes,
        }));

        let checked = self.guard_mutation(&table, producer, MutationOp::Insert)?;
        Ok(executor_node(&table, checked, MutationOp::Insert))
    }

    pub(crate) fn build_update(&mut self, update: &UpdateStmt) -> Result<Arc<RelationalPlan>> {
        let table = self.session().schema.read().require_table(&update.table)?;
        require_writable(&table)?;

        let (scan, scan_attributes) =
            self.build_mutation_scan(&table, update.where_clause.as_ref())?;
        let root = Scope::root();
        let scope = Scope::with_relations(
            &root,
            vec![RelationBinding::new(Some(&table.name), scan_attributes.clone())],
        );

        let mut assigned: Vec<(usize, ScalarPlan)> = Vec::with_capacity(update.assignments.len());
        for (name, expr) in &update.assignments {
            let position = table.column_index(name).ok_or_else(|| {
                QuereusError::not_found(format!(
                    "table '{}' has no column named {name}",
                    table.name
                ))
            })?;
            if assigned.iter().any(|(p, _)| *p == position) {
                return Err(QuereusError::misuse(format!(
                    "column '{name}' assigned more than once"
                )));
            }
            assigned.push((position, self.compile_expr(expr, &scope)?));
        }

        let update_id = next_plan_node_id();
        let column_exprs: Vec<ScalarPlan> = (0..table.columns.len())
            .map(|index| {
                assigned
                    .iter()
                    .find(|(p, _)| *p == index)
                    .map(|(_, expr)| expr.clone())
                    .unwrap_or_else(|| ScalarPlan::column(scan_attributes[index].clone()))
            })
            .collect();
        let attributes = mutation_attributes(&table, update_id);
        let producer = Arc::new(RelationalPlan::Update(UpdateNode {
            id: update_id,
            table: Arc::clone(&table),
            source: scan,
            column_exprs,
            attributes,
        }));

        let checked = self.guard_mutation(&table, producer, MutationOp::Update)?;
        Ok(executor_node(&table, checked, MutationOp::Update))
    }

    pub(crate) fn build_delete(&mut self, delete: &DeleteStmt) -> Result<Arc<RelationalPlan>> {
        let table = self.session().schema.read().require_table(&delete.table)?;
        require_writable(&table)?;

        let (scan, _) = self.build_mutation_scan(&table, delete.where_clause.as_ref())?;
        let delete_id = next_plan_node_id();
        let attributes = scan
            .attributes()
            .iter()
            .map(|a| a.carried_by(delete_id))
            .collect();
        let producer = Arc::new(RelationalPlan::Delete(DeleteNode {
            id: delete_id,
            table: Arc::clone(&table),
            source: scan,
            attributes,
        }));
        Ok(executor_node(&table, producer, MutationOp::Delete))
    }

    /// A filtered full-width scan of the mutation target, with
    /// push-down negotiated the same way SELECT does it
    fn build_mutation_scan(
        &mut self,
        table: &Arc<TableSchema>,
        where_clause: Option<&Expr>,
    ) -> Result<(Arc<RelationalPlan>, Vec<Attribute>)> {
        use crate::plan::{FilterNode, RetrieveNode, TableRef};

        let retrieve_id = next_plan_node_id();
        let attributes = table_attributes(table, retrieve_id);
        let root = Scope::root();
        let scope = Scope::with_relations(
            &root,
            vec![RelationBinding::new(Some(&table.name), attributes.clone())],
        );

        let conjuncts = match where_clause {
            Some(where_expr) => self.compile_expr(where_expr, &scope)?.conjuncts(),
            None => Vec::new(),
        };
        let (pushdown, residual, index, _) =
            self.negotiate_pushdown(table, &attributes, conjuncts, &[])?;

        let mut plan: Arc<RelationalPlan> = Arc::new(RelationalPlan::Retrieve(RetrieveNode {
            id: retrieve_id,
            table_ref: TableRef {
                table: Arc::clone(table),
                binding: table.name.clone(),
            },
            index,
            pushdown,
            relation_type: crate::plan::RelationType::from_attributes(&attributes),
            attributes: attributes.clone(),
        }));
        for predicate in residual {
            let filter_id = next_plan_node_id();
            let filter_attributes = plan
                .attributes()
                .iter()
                .map(|a| a.carried_by(filter_id))
                .collect();
            plan = Arc::new(RelationalPlan::Filter(FilterNode {
                id: filter_id,
                source: plan,
                predicate,
                attributes: filter_attributes,
            }));
        }
        Ok((plan, attributes))
    }

    /// Wrap a mutation producer in the constraint-check node
    fn guard_mutation(
        &mut self,
        table: &Arc<TableSchema>,
        source: Arc<RelationalPlan>,
        op: MutationOp,
    ) -> Result<Arc<RelationalPlan>> {
        let check_id = next_plan_node_id();
        let attributes: Vec<Attribute> = source
            .attributes()
            .iter()
            .map(|a| a.carried_by(check_id))
            .collect();

        // CHECK expressions evaluate against the candidate (new) row
        let root = Scope::root();
        let scope = Scope::with_relations(
            &root,
            vec![RelationBinding::new(
                Some(&table.name),
                source.attributes().to_vec(),
            )],
        );
        let mut checks = Vec::with_capacity(table.checks.len());
        for check in &table.checks {
            let expr = crate::parser::parse_expression(&check.expr_sql)?;
            checks.push(self.compile_expr(&expr, &scope)?);
        }

        Ok(Arc::new(RelationalPlan::ConstraintCheck(
            ConstraintCheckNode {
                id: check_id,
                table: Arc::clone(table),
                source,
                op,
                checks,
                attributes,
            },
        )))
    }
}

fn require_writable(table: &TableSchema) -> Result<()> {
    if table.read_only {
        return Err(QuereusError::new(
            StatusCode::ReadOnly,
            format!("table '{}' is read-only", table.name),
        ));
    }
    Ok(())
}

/// Fresh full-width attributes for a mutation producer's output
fn mutation_attributes(table: &TableSchema, node: crate::plan::PlanNodeId) -> Vec<Attribute> {
    table
        .columns
        .iter()
        .map(|column| {
            let ty = ScalarType {
                affinity: column.affinity,
                nullable: !column.not_null,
                collation: column.collation,
            };
            Attribute::new(&column.name, ty, node)
        })
        .collect()
}

fn executor_node(
    table: &Arc<TableSchema>,
    source: Arc<RelationalPlan>,
    op: MutationOp,
) -> Arc<RelationalPlan> {
    Arc::new(RelationalPlan::DmlExecutor(DmlExecutorNode {
        id: next_plan_node_id(),
        table: Arc::clone(table),
        source,
        op,
    }))
}

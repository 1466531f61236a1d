//! SELECT planning.
//!
//! Builds the relational pipeline for a query: FROM (with the
//! wrap-Retrieve rule and push-down negotiation for single-table
//! scans), WHERE, grouping/aggregation, HAVING, projection, DISTINCT,
//! ORDER BY (through a hidden-column extended projection when a sort
//! term is not part of the result), LIMIT/OFFSET, compound UNION ALL,
//! VALUES, and WITH-clause references. After the tree is complete the
//! owning module gets one `supports` probe; an accepted tree collapses
//! into a `RemoteQuery` node.

use super::expr::{collect_aggregates, mirror_op, AggCall, AggContext};
use super::{table_attributes, Planner, RelationBinding, Scope};
use crate::ast::{
    Expr, FromClause, JoinOp, OrderingTerm, ResultColumn, SelectBody, SelectCore, SelectStmt,
    TableFactor,
};
use crate::error::{QuereusError, Result, StatusCode};
use crate::plan::{
    next_plan_node_id, AggFunc, AggregateExpr, AggregateNode, Attribute, ConstraintOp, CteNode,
    DistinctNode, FilterNode, JoinKind, JoinNode, LimitOffsetNode, ProjectNode, PushedConstraint,
    RelColumn, RelationType, RelationalPlan, RemoteQueryNode, RetrieveNode, ScalarPlan, ScalarType,
    SortNode, SortSpec, TableRef, UnionAllNode, ValuesNode,
};
use crate::schema::{IndexSchema, TableSchema};
use crate::value::{TypeAffinity, Value};
use crate::vtab::{IndexConstraint, IndexInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

impl<'s> Planner<'s> {
    /// Build a full SELECT statement (body + ORDER BY + LIMIT/OFFSET)
    pub(crate) fn build_select(
        &mut self,
        stmt: &SelectStmt,
        outer: &Scope<'_>,
    ) -> Result<Arc<RelationalPlan>> {
        let has_ctes = !stmt.with.is_empty();
        if has_ctes {
            let mut layer = HashMap::new();
            for def in &stmt.with {
                layer.insert(def.name.to_ascii_lowercase(), def.clone());
            }
            self.ctes.push(layer);
        }
        let result = self.build_select_inner(stmt, outer);
        if has_ctes {
            self.ctes.pop();
        }
        let plan = result?;
        Ok(self.try_remote_pushdown(plan))
    }

    fn build_select_inner(
        &mut self,
        stmt: &SelectStmt,
        outer: &Scope<'_>,
    ) -> Result<Arc<RelationalPlan>> {
        match &stmt.body {
            SelectBody::Select(core) => self.build_core_pipeline(core, stmt, outer),
            SelectBody::Values(_) | SelectBody::UnionAll(_, _) => {
                let plan = self.build_body(&stmt.body, outer)?;
                let plan = self.apply_output_order(plan, &stmt.order_by, outer)?;
                self.apply_limit_offset(plan, stmt, outer)
            }
        }
    }

    /// Build a compound body (used for UNION ALL branches and VALUES)
    fn build_body(&mut self, body: &SelectBody, outer: &Scope<'_>) -> Result<Arc<RelationalPlan>> {
        match body {
            SelectBody::Values(rows) => self.build_values(rows, outer),
            SelectBody::Select(core) => {
                // A branch has no ORDER BY or LIMIT of its own
                let stmt = SelectStmt {
                    with: Vec::new(),
                    body: SelectBody::Select(core.clone()),
                    order_by: Vec::new(),
                    limit: None,
                    offset: None,
                };
                self.build_select_inner(&stmt, outer)
            }
            SelectBody::UnionAll(left, right) => {
                let left = self.build_body(left, outer)?;
                let right = self.build_body(right, outer)?;
                if left.arity() != right.arity() {
                    return Err(QuereusError::mismatch(format!(
                        "UNION ALL branches produce {} and {} columns",
                        left.arity(),
                        right.arity()
                    )));
                }
                let id = next_plan_node_id();
                let attributes = left
                    .attributes()
                    .iter()
                    .zip(right.attributes())
                    .map(|(l, r)| {
                        let ty = ScalarType {
                            affinity: l.ty.affinity,
                            nullable: l.ty.nullable || r.ty.nullable,
                            collation: l.ty.collation,
                        };
                        Attribute::new(&l.name, ty, id)
                    })
                    .collect();
                Ok(Arc::new(RelationalPlan::UnionAll(UnionAllNode {
                    id,
                    left,
                    right,
                    attributes,
                })))
            }
        }
    }

    pub(crate) fn build_values(
        &mut self,
        rows: &[Vec<Expr>],
        outer: &Scope<'_>,
    ) -> Result<Arc<RelationalPlan>> {
        if rows.is_empty() {
            return Err(QuereusError::misuse("VALUES requires at least one row"));
        }
        let width = rows[0].len();
        let mut compiled = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != width {
                return Err(QuereusError::mismatch(format!(
                    "VALUES rows have {} and {} columns",
                    width,
                    row.len()
                )));
            }
            compiled.push(
                row.iter()
                    .map(|expr| self.compile_expr(expr, outer))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        let id = next_plan_node_id();
        let attributes = compiled[0]
            .iter()
            .enumerate()
            .map(|(i, expr)| Attribute::new(format!("column{}", i + 1), expr.ty(), id))
            .collect();
        Ok(Arc::new(RelationalPlan::Values(ValuesNode {
            id,
            rows: compiled,
            attributes,
        })))
    }

    // ------------------------------------------------------------------
    // The core SELECT pipeline
    // ------------------------------------------------------------------

    fn build_core_pipeline(
        &mut self,
        core: &SelectCore,
        stmt: &SelectStmt,
        outer: &Scope<'_>,
    ) -> Result<Arc<RelationalPlan>> {
        // Bare-column ordering hints feed best_index when the FROM is a
        // single base table and nothing reorders above it
        let wants_order_hints = core.group_by.is_empty() && !core.distinct;

        let (mut plan, bindings, order_consumed) =
            self.build_from_and_where(core, stmt, outer, wants_order_hints)?;
        let scope = Scope::with_relations(outer, bindings.clone());

        // Aggregate detection: GROUP BY, or an aggregate call anywhere
        // in the result list or HAVING
        let mut agg_calls: Vec<AggCall> = Vec::new();
        for column in &core.columns {
            if let ResultColumn::Expr { expr, .. } = column {
                collect_aggregates(expr, &mut agg_calls)?;
            }
        }
        if let Some(having) = &core.having {
            collect_aggregates(having, &mut agg_calls)?;
        }
        let aggregated = !agg_calls.is_empty() || !core.group_by.is_empty();

        let agg_context = if aggregated {
            let (agg_plan, context) = self.build_aggregate(plan, core, &agg_calls, &scope)?;
            plan = agg_plan;
            if let Some(having) = &core.having {
                let predicate = self.compile_expr_agg(having, &scope, &context)?;
                plan = filter_node(plan, predicate);
            }
            Some(context)
        } else {
            if core.having.is_some() {
                return Err(QuereusError::misuse("HAVING without GROUP BY or aggregates"));
            }
            None
        };

        // Projection
        let mut exprs: Vec<ScalarPlan> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut star_only = true;
        for (index, column) in core.columns.iter().enumerate() {
            match column {
                ResultColumn::Star => {
                    if aggregated {
                        return Err(QuereusError::misuse(
                            "'*' cannot be combined with aggregate output",
                        ));
                    }
                    for binding in &bindings {
                        for attribute in &binding.attributes {
                            names.push(attribute.name.clone());
                            exprs.push(ScalarPlan::column(attribute.clone()));
                        }
                    }
                }
                ResultColumn::TableStar(table) => {
                    star_only = false;
                    let binding = scope.binding(table).ok_or_else(|| {
                        QuereusError::not_found(format!("no such table: {table}"))
                    })?;
                    for attribute in &binding.attributes {
                        names.push(attribute.name.clone());
                        exprs.push(ScalarPlan::column(attribute.clone()));
                    }
                }
                ResultColumn::Expr { expr, alias } => {
                    star_only = false;
                    let compiled = match &agg_context {
                        Some(context) => self.compile_expr_agg(expr, &scope, context)?,
                        None => self.compile_expr(expr, &scope)?,
                    };
                    names.push(
                        alias
                            .clone()
                            .unwrap_or_else(|| result_name(expr, index)),
                    );
                    exprs.push(compiled);
                }
            }
        }

        // Identity-projection elision keeps `SELECT * FROM t` pipelines
        // eligible for push-down
        let elide_projection = star_only
            && core.columns.len() == 1
            && !aggregated
            && exprs.len() == plan.arity()
            && exprs.iter().zip(plan.attributes()).all(|(e, a)| {
                matches!(e, ScalarPlan::ColumnRef { attribute } if attribute.id == a.id)
            });

        if !elide_projection {
            plan = project_node(plan, exprs, &names);
        }

        // ORDER BY resolution against the visible output, with hidden
        // extended columns for terms that reach back into the source
        let mut hidden: Vec<(ScalarPlan, String)> = Vec::new();
        let mut keys: Vec<(usize, bool)> = Vec::new(); // (output position, desc)
        if !order_consumed {
            for term in &stmt.order_by {
                let position = self.resolve_order_term(
                    term,
                    plan.attributes(),
                    &scope,
                    agg_context.as_ref(),
                    &mut hidden,
                )?;
                keys.push((position, term.desc));
            }
        }

        if hidden.is_empty() {
            if core.distinct {
                plan = distinct_node(plan);
            }
            if !keys.is_empty() {
                plan = sort_by_positions(plan, &keys);
            }
        } else {
            if core.distinct {
                return Err(QuereusError::unsupported(
                    "ORDER BY terms must appear in the result set of a DISTINCT query",
                ));
            }
            let visible = plan.arity();
            // Extend, sort, then strip the hidden columns
            let (exprs, names): (Vec<ScalarPlan>, Vec<String>) = plan
                .attributes()
                .iter()
                .map(|a| (ScalarPlan::column(a.clone()), a.name.clone()))
                .chain(hidden.into_iter().map(|(e, n)| (e, n)))
                .unzip();
            plan = project_node(plan, exprs, &names);
            plan = sort_by_positions(plan, &keys);
            let (strip_exprs, strip_names): (Vec<ScalarPlan>, Vec<String>) = plan
                .attributes()
                .iter()
                .take(visible)
                .map(|a| (ScalarPlan::column(a.clone()), a.name.clone()))
                .unzip();
            plan = project_node(plan, strip_exprs, &strip_names);
        }

        self.apply_limit_offset(plan, stmt, outer)
    }

    /// Resolve one ORDER BY term to an output position, appending a
    /// hidden column when it references the pre-projection source
    fn resolve_order_term(
        &mut self,
        term: &OrderingTerm,
        output: &[Attribute],
        scope: &Scope<'_>,
        agg: Option<&AggContext>,
        hidden: &mut Vec<(ScalarPlan, String)>,
    ) -> Result<usize> {
        // Ordinal
        if let Expr::Literal(Value::Integer(ordinal)) = &term.expr {
            let position = *ordinal;
            if position < 1 || position as usize > output.len() {
                return Err(QuereusError::new(
                    StatusCode::Range,
                    format!("ORDER BY position {position} is out of range"),
                ));
            }
            return Ok(position as usize - 1);
        }
        // Output-column name
        if let Expr::Column {
            table: None, name, ..
        } = &term.expr
        {
            if let Some(position) = output
                .iter()
                .position(|a| a.name.eq_ignore_ascii_case(name))
            {
                return Ok(position);
            }
        }
        // Anything else reaches into the source
        let compiled = match agg {
            Some(context) => self.compile_expr_agg(&term.expr, scope, context)?,
            None => self.compile_expr(&term.expr, scope)?,
        };
        let position = output.len() + hidden.len();
        hidden.push((compiled, format!("__sort{}", hidden.len())));
        Ok(position)
    }

    fn apply_limit_offset(
        &mut self,
        plan: Arc<RelationalPlan>,
        stmt: &SelectStmt,
        outer: &Scope<'_>,
    ) -> Result<Arc<RelationalPlan>> {
        if stmt.limit.is_none() && stmt.offset.is_none() {
            return Ok(plan);
        }
        let limit = match &stmt.limit {
            Some(expr) => Some(self.compile_expr(expr, outer)?),
            None => None,
        };
        let offset = match &stmt.offset {
            Some(expr) => Some(self.compile_expr(expr, outer)?),
            None => None,
        };
        let id = next_plan_node_id();
        let attributes = plan.attributes().iter().map(|a| a.carried_by(id)).collect();
        Ok(Arc::new(RelationalPlan::LimitOffset(LimitOffsetNode {
            id,
            source: plan,
            limit,
            offset,
            attributes,
        })))
    }

    /// ORDER BY over VALUES/UNION output: ordinals and output names only
    fn apply_output_order(
        &mut self,
        plan: Arc<RelationalPlan>,
        order_by: &[OrderingTerm],
        _outer: &Scope<'_>,
    ) -> Result<Arc<RelationalPlan>> {
        if order_by.is_empty() {
            return Ok(plan);
        }
        let mut keys = Vec::with_capacity(order_by.len());
        for term in order_by {
            let position = match &term.expr {
                Expr::Literal(Value::Integer(ordinal))
                    if *ordinal >= 1 && (*ordinal as usize) <= plan.arity() =>
                {
                    *ordinal as usize - 1
                }
                Expr::Column {
                    table: None, name, ..
                } => plan
                    .attributes()
                    .iter()
                    .position(|a| a.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        QuereusError::not_found(format!("no such output column: {name}"))
                    })?,
                _ => {
                    return Err(QuereusError::unsupported(
                        "compound ORDER BY terms must be output columns or ordinals",
                    ));
                }
            };
            keys.push((position, term.desc));
        }
        Ok(sort_by_positions(plan, &keys))
    }

    // ------------------------------------------------------------------
    // FROM and WHERE, with push-down negotiation
    // ------------------------------------------------------------------

    fn build_from_and_where(
        &mut self,
        core: &SelectCore,
        stmt: &SelectStmt,
        outer: &Scope<'_>,
        wants_order_hints: bool,
    ) -> Result<(Arc<RelationalPlan>, Vec<RelationBinding>, bool)> {
        let Some(from) = &core.from else {
            // FROM-less SELECT reads the one empty row
            let plan = RelationalPlan::single_row();
            let plan = match &core.where_clause {
                Some(where_expr) => {
                    let root_scope = Scope::with_relations(outer, Vec::new());
                    let predicate = self.compile_expr(where_expr, &root_scope)?;
                    filter_node(plan, predicate)
                }
                None => plan,
            };
            return Ok((plan, Vec::new(), false));
        };

        // Single base table: negotiate push-down with the module
        if from.joins.is_empty() {
            if let TableFactor::Table { name, alias, loc } = &from.first {
                let is_cte = self.lookup_cte(name).is_some();
                let is_view = self.session().schema.read().view(name).is_some();
                if !is_cte && !is_view {
                    let table = self
                        .session()
                        .schema
                        .read()
                        .require_table(name)
                        .map_err(|e| e.at(*loc))?;
                    let binding_name = alias.as_deref().unwrap_or(name).to_string();
                    return self.build_single_table(
                        &table,
                        &binding_name,
                        core,
                        stmt,
                        outer,
                        wants_order_hints,
                    );
                }
            }
        }

        // General case: fold factors into a join tree, no push-down
        let (plan, bindings) = self.build_from(from, outer)?;
        let plan = match &core.where_clause {
            Some(where_expr) => {
                let scope = Scope::with_relations(outer, bindings.clone());
                let predicate = self.compile_expr(where_expr, &scope)?;
                filter_node(plan, predicate)
            }
            None => plan,
        };
        Ok((plan, bindings, false))
    }

    fn build_single_table(
        &mut self,
        table: &Arc<TableSchema>,
        binding_name: &str,
        core: &SelectCore,
        stmt: &SelectStmt,
        outer: &Scope<'_>,
        wants_order_hints: bool,
    ) -> Result<(Arc<RelationalPlan>, Vec<RelationBinding>, bool)> {
        let retrieve_id = next_plan_node_id();
        let attributes = table_attributes(table, retrieve_id);
        let binding = RelationBinding::new(Some(binding_name), attributes.clone());
        let scope = Scope::with_relations(outer, vec![binding.clone()]);

        let conjuncts = match &core.where_clause {
            Some(where_expr) => self.compile_expr(where_expr, &scope)?.conjuncts(),
            None => Vec::new(),
        };

        // Bare-column ORDER BY terms become ordering hints
        let order_hints: Vec<(usize, bool)> = if wants_order_hints {
            stmt.order_by
                .iter()
                .filter_map(|term| match &term.expr {
                    Expr::Column {
                        table: qualifier,
                        name,
                        ..
                    } => {
                        if qualifier
                            .as_deref()
                            .is_some_and(|q| !q.eq_ignore_ascii_case(binding_name))
                        {
                            return None;
                        }
                        table.column_index(name).map(|col| (col, term.desc))
                    }
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };
        let hints_cover_order = order_hints.len() == stmt.order_by.len();

        let (pushdown, residual, index, order_consumed) =
            self.negotiate_pushdown(table, &attributes, conjuncts, &order_hints)?;

        let relation_type = relation_type_of(table);
        let mut plan: Arc<RelationalPlan> = Arc::new(RelationalPlan::Retrieve(RetrieveNode {
            id: retrieve_id,
            table_ref: TableRef {
                table: Arc::clone(table),
                binding: binding_name.to_string(),
            },
            index,
            pushdown,
            attributes,
            relation_type,
        }));
        for predicate in residual {
            plan = filter_node(plan, predicate);
        }
        Ok((
            plan,
            vec![binding],
            order_consumed && hints_cover_order && !stmt.order_by.is_empty(),
        ))
    }

    /// Offer WHERE conjuncts and ordering to the module; split into
    /// pushed constraints and residual predicates
    pub(crate) fn negotiate_pushdown(
        &mut self,
        table: &Arc<TableSchema>,
        attributes: &[Attribute],
        conjuncts: Vec<ScalarPlan>,
        order_hints: &[(usize, bool)],
    ) -> Result<(
        Vec<PushedConstraint>,
        Vec<ScalarPlan>,
        Option<Arc<IndexSchema>>,
        bool,
    )> {
        // A candidate is `col OP constant-expr` (or mirrored)
        let mut candidates: Vec<(usize, ConstraintOp, ScalarPlan, usize)> = Vec::new();
        let mut residual: Vec<ScalarPlan> = Vec::new();
        let mut others: Vec<(usize, ScalarPlan)> = Vec::new();

        for (slot, conjunct) in conjuncts.into_iter().enumerate() {
            match extract_candidate(&conjunct, attributes) {
                Some((column, op)) => {
                    let value = match &conjunct {
                        ScalarPlan::Binary { left, right, .. } => {
                            if matches!(&**left, ScalarPlan::ColumnRef { .. }) {
                                (**right).clone()
                            } else {
                                (**left).clone()
                            }
                        }
                        _ => unreachable!("candidate is always a binary comparison"),
                    };
                    candidates.push((column, op, value, slot));
                    others.push((slot, conjunct));
                }
                None => residual.push(conjunct),
            }
        }

        if candidates.is_empty() && order_hints.is_empty() {
            return Ok((Vec::new(), residual, None, false));
        }

        let constraints: Vec<IndexConstraint> = candidates
            .iter()
            .map(|(column, op, _, _)| IndexConstraint {
                column: *column,
                op: *op,
                usable: true,
            })
            .collect();
        let mut info = IndexInfo::new(constraints, order_hints.to_vec());
        let module = self.session().module(&table.module_name)?;
        let indexes = self.session().schema.read().indexes_for_table(&table.name);
        module.best_index(table, &indexes, &mut info)?;

        let mut pushed: Vec<(usize, PushedConstraint)> = Vec::new();
        for (position, (column, op, value, slot)) in candidates.into_iter().enumerate() {
            let usage = &info.constraint_usage[position];
            match usage.argv_index {
                Some(argv) => {
                    pushed.push((
                        argv,
                        PushedConstraint {
                            column,
                            op,
                            value,
                        },
                    ));
                    if !usage.omit {
                        if let Some((_, conjunct)) =
                            others.iter().find(|(s, _)| *s == slot)
                        {
                            residual.push(conjunct.clone());
                        }
                    }
                }
                None => {
                    if let Some((_, conjunct)) = others.iter().find(|(s, _)| *s == slot) {
                        residual.push(conjunct.clone());
                    }
                }
            }
        }
        pushed.sort_by_key(|(argv, _)| *argv);
        let pushdown: Vec<PushedConstraint> =
            pushed.into_iter().map(|(_, constraint)| constraint).collect();

        let index = match &info.index_name {
            Some(name) => Some(
                indexes
                    .iter()
                    .find(|i| i.name.eq_ignore_ascii_case(name))
                    .cloned()
                    .ok_or_else(|| {
                        QuereusError::internal(format!(
                            "module chose unknown index '{name}' for '{}'",
                            table.name
                        ))
                    })?,
            ),
            None => None,
        };
        trace!(
            table = %table.name,
            pushed = pushdown.len(),
            residual = residual.len(),
            index = info.index_name.as_deref().unwrap_or("pk"),
            "push-down negotiated"
        );
        Ok((pushdown, residual, index, info.order_by_consumed))
    }

    fn build_from(
        &mut self,
        from: &FromClause,
        outer: &Scope<'_>,
    ) -> Result<(Arc<RelationalPlan>, Vec<RelationBinding>)> {
        let (mut plan, first_binding) = self.build_factor(&from.first, outer)?;
        let mut bindings = vec![first_binding];

        for join in &from.joins {
            let (right_plan, right_binding) = self.build_factor(&join.factor, outer)?;
            let kind = match join.op {
                JoinOp::Inner => JoinKind::Inner,
                JoinOp::LeftOuter => JoinKind::LeftOuter,
                JoinOp::Cross => JoinKind::Cross,
            };

            let join_id = next_plan_node_id();
            let right_attributes: Vec<Attribute> = if kind == JoinKind::LeftOuter {
                right_binding.attributes.iter().map(Attribute::nullable).collect()
            } else {
                right_binding.attributes.clone()
            };
            let attributes: Vec<Attribute> = bindings
                .iter()
                .flat_map(|b| b.attributes.iter())
                .chain(right_attributes.iter())
                .map(|a| a.carried_by(join_id))
                .collect();

            let padded_binding =
                RelationBinding::new(right_binding.name.as_deref(), right_attributes);
            let mut on_bindings = bindings.clone();
            on_bindings.push(padded_binding.clone());

            let on = match &join.on {
                Some(on_expr) => {
                    let scope = Scope::with_relations(outer, on_bindings);
                    Some(self.compile_expr(on_expr, &scope)?)
                }
                None => {
                    if kind == JoinKind::Inner {
                        return Err(QuereusError::misuse("JOIN requires an ON clause"));
                    }
                    None
                }
            };

            bindings.push(padded_binding);
            plan = Arc::new(RelationalPlan::Join(JoinNode {
                id: join_id,
                left: plan,
                right: right_plan,
                kind,
                on,
                attributes,
            }));
        }
        Ok((plan, bindings))
    }

    fn build_factor(
        &mut self,
        factor: &TableFactor,
        outer: &Scope<'_>,
    ) -> Result<(Arc<RelationalPlan>, RelationBinding)> {
        match factor {
            TableFactor::Table { name, alias, loc } => {
                let binding_name = alias.as_deref().unwrap_or(name);
                // WITH bindings shadow views, which shadow tables
                if let Some(def) = self.lookup_cte(name) {
                    return self.build_cte_reference(&def, binding_name);
                }
                let view = self.session().schema.read().view(name);
                if let Some(view) = view {
                    let statements = crate::parser::parse_program(&view.sql)?;
                    let Some(crate::ast::Stmt::Select(select)) = statements.into_iter().next()
                    else {
                        return Err(QuereusError::internal(format!(
                            "view '{}' does not store a SELECT",
                            view.name
                        )));
                    };
                    let root = Scope::root();
                    let mut plan = self.build_select(&select, &root)?;
                    if let Some(names) = &view.column_names {
                        plan = rename_columns(plan, names)?;
                    }
                    let binding =
                        RelationBinding::new(Some(binding_name), plan.attributes().to_vec());
                    return Ok((plan, binding));
                }
                let table = self
                    .session()
                    .schema
                    .read()
                    .require_table(name)
                    .map_err(|e| e.at(*loc))?;
                let retrieve_id = next_plan_node_id();
                let attributes = table_attributes(&table, retrieve_id);
                let binding = RelationBinding::new(Some(binding_name), attributes.clone());
                let plan = Arc::new(RelationalPlan::Retrieve(RetrieveNode {
                    id: retrieve_id,
                    table_ref: TableRef {
                        table: Arc::clone(&table),
                        binding: binding_name.to_string(),
                    },
                    index: None,
                    pushdown: Vec::new(),
                    relation_type: relation_type_of(&table),
                    attributes,
                }));
                Ok((plan, binding))
            }
            TableFactor::Subquery { select, alias } => {
                let root = Scope::root();
                let plan = self.build_select(select, &root)?;
                let binding =
                    RelationBinding::new(alias.as_deref(), plan.attributes().to_vec());
                Ok((plan, binding))
            }
        }
    }

    fn lookup_cte(&self, name: &str) -> Option<crate::ast::CteDef> {
        let wanted = name.to_ascii_lowercase();
        if self.cte_building.contains(&wanted) {
            return None;
        }
        self.ctes
            .iter()
            .rev()
            .find_map(|layer| layer.get(&wanted).cloned())
    }

    fn build_cte_reference(
        &mut self,
        def: &crate::ast::CteDef,
        binding_name: &str,
    ) -> Result<(Arc<RelationalPlan>, RelationBinding)> {
        let guard_name = def.name.to_ascii_lowercase();
        self.cte_building.push(guard_name);
        let root = Scope::root();
        let built = self.build_select(&def.select, &root);
        self.cte_building.pop();
        let source = built?;

        if let Some(names) = &def.column_names {
            if names.len() != source.arity() {
                return Err(QuereusError::mismatch(format!(
                    "CTE '{}' declares {} columns but produces {}",
                    def.name,
                    names.len(),
                    source.arity()
                )));
            }
        }

        let id = next_plan_node_id();
        let attributes: Vec<Attribute> = source
            .attributes()
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let name = def
                    .column_names
                    .as_ref()
                    .and_then(|names| names.get(i).cloned())
                    .unwrap_or_else(|| a.name.clone());
                Attribute::new(name, a.ty, id)
            })
            .collect();
        let plan = Arc::new(RelationalPlan::Cte(CteNode {
            id,
            name: def.name.clone(),
            source,
            materialized: def.materialized == Some(true),
            attributes,
        }));
        let binding = RelationBinding::new(Some(binding_name), plan.attributes().to_vec());
        Ok((plan, binding))
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    fn build_aggregate(
        &mut self,
        source: Arc<RelationalPlan>,
        core: &SelectCore,
        agg_calls: &[AggCall],
        scope: &Scope<'_>,
    ) -> Result<(Arc<RelationalPlan>, AggContext)> {
        let id = next_plan_node_id();
        let mut attributes = Vec::new();

        let mut group_by = Vec::with_capacity(core.group_by.len());
        let mut group_ctx = Vec::with_capacity(core.group_by.len());
        for (index, group_expr) in core.group_by.iter().enumerate() {
            let compiled = self.compile_expr(group_expr, scope)?;
            let attribute =
                Attribute::new(result_name(group_expr, index), compiled.ty(), id);
            attributes.push(attribute.clone());
            group_ctx.push((group_expr.clone(), attribute));
            group_by.push(compiled);
        }

        let mut aggregates = Vec::with_capacity(agg_calls.len());
        let mut agg_ctx = Vec::with_capacity(agg_calls.len());
        for call in agg_calls {
            let func = AggFunc::from_name(&call.name).ok_or_else(|| {
                QuereusError::not_found(format!("no such aggregate function: {}", call.name))
            })?;
            let arg = match (call.star, call.args.len()) {
                (true, _) => {
                    if func != AggFunc::Count {
                        return Err(QuereusError::misuse(format!(
                            "{}(*) is not valid",
                            call.name
                        )));
                    }
                    None
                }
                (false, 1) => Some(self.compile_expr(&call.args[0], scope)?),
                (false, 0) => {
                    return Err(QuereusError::misuse(format!(
                        "{}() requires an argument",
                        call.name
                    )));
                }
                (false, n) => {
                    return Err(QuereusError::unsupported(format!(
                        "{}() with {n} arguments",
                        call.name
                    )));
                }
            };
            let ty = aggregate_output_type(func, arg.as_ref());
            let display = if call.star {
                format!("{}(*)", call.name.to_ascii_lowercase())
            } else {
                format!(
                    "{}({})",
                    call.name.to_ascii_lowercase(),
                    result_name(&call.args[0], 0)
                )
            };
            let attribute = Attribute::new(display, ty, id);
            attributes.push(attribute.clone());
            agg_ctx.push((call.clone(), attribute));
            aggregates.push(AggregateExpr {
                func,
                arg,
                distinct: call.distinct,
            });
        }

        let plan = Arc::new(RelationalPlan::Aggregate(AggregateNode {
            id,
            source,
            group_by,
            aggregates,
            attributes,
        }));
        Ok((
            plan,
            AggContext {
                group: group_ctx,
                aggregates: agg_ctx,
            },
        ))
    }

    /// Offer the finished tree to its (single) table's module
    fn try_remote_pushdown(&self, plan: Arc<RelationalPlan>) -> Arc<RelationalPlan> {
        let mut tables = Vec::new();
        collect_retrieve_tables(&plan, &mut tables);
        let [table] = tables.as_slice() else {
            return plan;
        };
        let Ok(module) = self.session().module(&table.module_name) else {
            return plan;
        };
        match module.supports(&plan) {
            Some(ctx) => {
                trace!(table = %table.name, "pipeline accepted for push-down");
                Arc::new(RelationalPlan::RemoteQuery(RemoteQueryNode {
                    id: next_plan_node_id(),
                    table: Arc::clone(table),
                    fallback: plan,
                    ctx,
                }))
            }
            None => plan,
        }
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn filter_node(source: Arc<RelationalPlan>, predicate: ScalarPlan) -> Arc<RelationalPlan> {
    let id = next_plan_node_id();
    let attributes = source.attributes().iter().map(|a| a.carried_by(id)).collect();
    Arc::new(RelationalPlan::Filter(FilterNode {
        id,
        source,
        predicate,
        attributes,
    }))
}

fn distinct_node(source: Arc<RelationalPlan>) -> Arc<RelationalPlan> {
    let id = next_plan_node_id();
    let attributes = source.attributes().iter().map(|a| a.carried_by(id)).collect();
    Arc::new(RelationalPlan::Distinct(DistinctNode {
        id,
        source,
        attributes,
    }))
}

fn project_node(
    source: Arc<RelationalPlan>,
    exprs: Vec<ScalarPlan>,
    names: &[String],
) -> Arc<RelationalPlan> {
    let id = next_plan_node_id();
    let attributes = exprs
        .iter()
        .zip(names)
        .map(|(expr, name)| Attribute::new(name.clone(), expr.ty(), id))
        .collect();
    Arc::new(RelationalPlan::Project(ProjectNode {
        id,
        source,
        exprs,
        attributes,
    }))
}

fn sort_by_positions(source: Arc<RelationalPlan>, keys: &[(usize, bool)]) -> Arc<RelationalPlan> {
    let id = next_plan_node_id();
    let attributes: Vec<Attribute> =
        source.attributes().iter().map(|a| a.carried_by(id)).collect();
    let specs = keys
        .iter()
        .map(|(position, desc)| SortSpec {
            expr: ScalarPlan::column(source.attributes()[*position].clone()),
            desc: *desc,
        })
        .collect();
    Arc::new(RelationalPlan::Sort(SortNode {
        id,
        source,
        keys: specs,
        attributes,
    }))
}

/// Wrap a plan in a renaming projection
fn rename_columns(source: Arc<RelationalPlan>, names: &[String]) -> Result<Arc<RelationalPlan>> {
    if names.len() != source.arity() {
        return Err(QuereusError::mismatch(format!(
            "{} names for {} columns",
            names.len(),
            source.arity()
        )));
    }
    let exprs: Vec<ScalarPlan> = source
        .attributes()
        .iter()
        .map(|a| ScalarPlan::column(a.clone()))
        .collect();
    Ok(project_node(source, exprs, names))
}

fn relation_type_of(table: &TableSchema) -> RelationType {
    RelationType {
        columns: table
            .columns
            .iter()
            .map(|c| RelColumn {
                name: c.name.clone(),
                ty: ScalarType {
                    affinity: c.affinity,
                    nullable: !c.not_null,
                    collation: c.collation,
                },
                hidden: c.hidden,
            })
            .collect(),
        keys: vec![table.primary_key.clone()],
        read_only: table.read_only,
        row_constraints: table.checks.iter().map(|c| c.expr_sql.clone()).collect(),
    }
}

/// Match `col OP constant` (or its mirror) against a table's attributes
fn extract_candidate(
    conjunct: &ScalarPlan,
    attributes: &[Attribute],
) -> Option<(usize, ConstraintOp)> {
    let ScalarPlan::Binary {
        op, left, right, ..
    } = conjunct
    else {
        return None;
    };
    let to_constraint = |op: crate::ast::BinaryOp| match op {
        crate::ast::BinaryOp::Eq => Some(ConstraintOp::Eq),
        crate::ast::BinaryOp::Lt => Some(ConstraintOp::Lt),
        crate::ast::BinaryOp::Le => Some(ConstraintOp::Le),
        crate::ast::BinaryOp::Gt => Some(ConstraintOp::Gt),
        crate::ast::BinaryOp::Ge => Some(ConstraintOp::Ge),
        _ => None,
    };

    let column_of = |expr: &ScalarPlan| match expr {
        ScalarPlan::ColumnRef { attribute } => attributes
            .iter()
            .position(|a| a.id == attribute.id),
        _ => None,
    };
    let is_constant =
        |expr: &ScalarPlan| expr.referenced_attributes().is_empty() && !expr.contains_subquery();

    if let (Some(column), true) = (column_of(left), is_constant(right)) {
        return to_constraint(*op).map(|c| (column, c));
    }
    if let (Some(column), true) = (column_of(right), is_constant(left)) {
        return mirror_op(*op)
            .and_then(to_constraint)
            .map(|c| (column, c));
    }
    None
}

fn collect_retrieve_tables(plan: &Arc<RelationalPlan>, out: &mut Vec<Arc<TableSchema>>) {
    if let RelationalPlan::Retrieve(node) = plan.as_ref() {
        out.push(Arc::clone(&node.table_ref.table));
    }
    for child in plan.children() {
        collect_retrieve_tables(child, out);
    }
}

fn aggregate_output_type(func: AggFunc, arg: Option<&ScalarPlan>) -> ScalarType {
    match func {
        AggFunc::Count => ScalarType::integer().not_null(),
        AggFunc::Total => ScalarType::real().not_null(),
        AggFunc::Avg => ScalarType::real(),
        AggFunc::Sum => ScalarType::new(TypeAffinity::Numeric),
        AggFunc::Min | AggFunc::Max => arg.map_or(ScalarType::numeric(), |a| {
            let mut ty = a.ty();
            ty.nullable = true;
            ty
        }),
    }
}

/// Output-column name for an expression without an alias
fn result_name(expr: &Expr, index: usize) -> String {
    match expr {
        Expr::Column { name, .. } => name.clone(),
        Expr::Literal(value) => value.to_display_string(),
        Expr::Function {
            name, star, args, ..
        } => {
            if *star {
                format!("{}(*)", name.to_ascii_lowercase())
            } else {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|arg| match arg {
                        Expr::Column { name, .. } => name.clone(),
                        Expr::Literal(value) => value.to_display_string(),
                        _ => "...".to_string(),
                    })
                    .collect();
                format!("{}({})", name.to_ascii_lowercase(), rendered.join(", "))
            }
        }
        _ => format!("column{}", index + 1),
    }
}

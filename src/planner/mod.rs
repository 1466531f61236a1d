//! # Plan Builder
//!
//! AST to plan-tree conversion. Dispatches per statement kind, resolves
//! table references against the catalog and column references through
//! the [`Scope`] chain, wraps every base table in a `Retrieve` node,
//! negotiates constraint push-down with the table's module, and builds
//! the mutation pipelines for DML.
//!
//! ```text
//! ast::Stmt -> [Planner] -> PlanNode -> Emitter
//! ```

mod dml;
mod expr;
pub mod scope;
mod select;

pub use scope::{RelationBinding, Scope};

use crate::ast::{
    CheckDef, ColumnDef, CreateIndexStmt, CreateTableStmt, CreateViewStmt, Expr, ParamRef, Stmt,
    UnaryOp,
};
use crate::error::{QuereusError, Result, StatusCode};
use crate::plan::{
    next_plan_node_id, Attribute, BlockNode, PlanNode, RelationalPlan, ScalarPlan, ScalarType,
    SinkPlan,
};
use crate::schema::{CheckConstraint, ColumnSchema, IndexSchema, SortOrder, TableSchema, ViewSchema};
use crate::session::Session;
use crate::value::{Collation, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds plan trees for one session
pub struct Planner<'s> {
    session: &'s Session,
    /// CTE definitions in scope, innermost last
    ctes: Vec<HashMap<String, crate::ast::CteDef>>,
    /// CTE names currently being expanded (self-reference guard)
    cte_building: Vec<String>,
    /// Caller-provided parameter types
    param_hints: HashMap<ParamRef, ScalarType>,
}

impl<'s> Planner<'s> {
    pub fn new(session: &'s Session) -> Self {
        Planner {
            session,
            ctes: Vec::new(),
            cte_building: Vec::new(),
            param_hints: HashMap::new(),
        }
    }

    pub fn with_param_hints(mut self, hints: HashMap<ParamRef, ScalarType>) -> Self {
        self.param_hints = hints;
        self
    }

    pub(crate) fn session(&self) -> &Session {
        self.session
    }

    /// Build a whole statement program as a Block
    pub fn build_program(&mut self, stmts: &[Stmt]) -> Result<PlanNode> {
        if stmts.len() == 1 {
            return self.build_statement(&stmts[0]);
        }
        let statements: Vec<PlanNode> = stmts
            .iter()
            .map(|s| self.build_statement(s))
            .collect::<Result<_>>()?;
        let id = next_plan_node_id();
        let attributes = statements
            .iter()
            .rev()
            .find_map(|s| s.as_relational())
            .map(|plan| {
                plan.attributes()
                    .iter()
                    .map(|a| a.carried_by(id))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(PlanNode::Relational(Arc::new(RelationalPlan::Block(
            BlockNode {
                id,
                statements,
                attributes,
            },
        ))))
    }

    /// Build one statement
    pub fn build_statement(&mut self, stmt: &Stmt) -> Result<PlanNode> {
        let plan = match stmt {
            Stmt::Select(select) => {
                let root = Scope::root();
                PlanNode::Relational(self.build_select(select, &root)?)
            }
            Stmt::Insert(insert) => PlanNode::Relational(self.build_insert(insert)?),
            Stmt::Update(update) => PlanNode::Relational(self.build_update(update)?),
            Stmt::Delete(delete) => PlanNode::Relational(self.build_delete(delete)?),
            Stmt::CreateTable(create) => self.build_create_table(create)?,
            Stmt::DropTable { name, if_exists } => {
                if !*if_exists {
                    self.session.schema.read().require_table(name)?;
                }
                PlanNode::Sink(Arc::new(SinkPlan::DropTable {
                    name: name.clone(),
                    if_exists: *if_exists,
                }))
            }
            Stmt::CreateIndex(create) => self.build_create_index(create)?,
            Stmt::DropIndex { name, if_exists } => {
                if !*if_exists && self.session.schema.read().index(name).is_none() {
                    return Err(QuereusError::not_found(format!("no such index: {name}")));
                }
                PlanNode::Sink(Arc::new(SinkPlan::DropIndex {
                    name: name.clone(),
                    if_exists: *if_exists,
                }))
            }
            Stmt::CreateView(create) => self.build_create_view(create)?,
            Stmt::DropView { name, if_exists } => {
                if !*if_exists && self.session.schema.read().view(name).is_none() {
                    return Err(QuereusError::not_found(format!("no such view: {name}")));
                }
                PlanNode::Sink(Arc::new(SinkPlan::DropView {
                    name: name.clone(),
                    if_exists: *if_exists,
                }))
            }
            Stmt::Begin => PlanNode::Sink(Arc::new(SinkPlan::Begin)),
            Stmt::Commit => PlanNode::Sink(Arc::new(SinkPlan::Commit)),
            Stmt::Rollback { to_savepoint } => PlanNode::Sink(Arc::new(SinkPlan::Rollback {
                to_savepoint: to_savepoint.clone(),
            })),
            Stmt::Savepoint { name } => {
                PlanNode::Sink(Arc::new(SinkPlan::Savepoint { name: name.clone() }))
            }
            Stmt::Release { name } => {
                PlanNode::Sink(Arc::new(SinkPlan::Release { name: name.clone() }))
            }
            Stmt::Pragma { name, value } => {
                let compiled = match value {
                    Some(expr) => {
                        let root = Scope::root();
                        Some(self.compile_expr(expr, &root)?)
                    }
                    None => None,
                };
                PlanNode::Sink(Arc::new(SinkPlan::Pragma {
                    name: name.clone(),
                    value: compiled,
                }))
            }
            Stmt::Analyze { table } => {
                let resolved = match table {
                    Some(name) => Some(self.session.schema.read().require_table(name)?),
                    None => None,
                };
                PlanNode::Sink(Arc::new(SinkPlan::Analyze { table: resolved }))
            }
        };
        if let PlanNode::Relational(relational) = &plan {
            debug!(plan = %relational.summary(), "statement planned");
        }
        Ok(plan)
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn build_create_table(&mut self, create: &CreateTableStmt) -> Result<PlanNode> {
        if !create.if_not_exists && self.session.schema.read().table(&create.name).is_some() {
            return Err(QuereusError::misuse(format!(
                "table '{}' already exists",
                create.name
            )));
        }

        let mut columns = Vec::with_capacity(create.columns.len());
        let mut pk_from_columns = Vec::new();
        for (index, def) in create.columns.iter().enumerate() {
            columns.push(self.build_column_schema(def)?);
            if def.primary_key {
                pk_from_columns.push(index);
            }
        }

        let primary_key = match (&create.primary_key, pk_from_columns.as_slice()) {
            (Some(_), [_, ..]) => {
                return Err(QuereusError::misuse(
                    "PRIMARY KEY declared both on a column and at table level",
                ));
            }
            (Some(names), []) => {
                let mut indices = Vec::with_capacity(names.len());
                for name in names {
                    let position = columns
                        .iter()
                        .position(|c: &ColumnSchema| c.name.eq_ignore_ascii_case(name))
                        .ok_or_else(|| {
                            QuereusError::not_found(format!(
                                "no such column in PRIMARY KEY: {name}"
                            ))
                        })?;
                    if indices.contains(&position) {
                        return Err(QuereusError::misuse(format!(
                            "duplicate PRIMARY KEY column: {name}"
                        )));
                    }
                    indices.push(position);
                }
                indices
            }
            (None, found) if !found.is_empty() => found.to_vec(),
            (None, _) => {
                return Err(QuereusError::misuse(format!(
                    "table '{}' requires a PRIMARY KEY",
                    create.name
                )));
            }
        };
        // Key columns are implicitly NOT NULL
        for &pk_col in &primary_key {
            columns[pk_col].not_null = true;
        }

        let (module_name, module_args) = match &create.module {
            Some((name, args)) => (name.clone(), args.clone()),
            None => (self.session.default_module_name(), Vec::new()),
        };
        // Unknown modules fail at build time
        self.session.module(&module_name)?;

        let mut table = TableSchema::new(&create.name, &module_name, columns, primary_key);
        table.module_args = module_args;
        table.checks = create
            .checks
            .iter()
            .map(|check| CheckConstraint {
                name: check.name.clone(),
                expr_sql: check.sql.clone(),
            })
            .collect();
        let table = Arc::new(table);

        // Validate CHECK expressions against the would-be columns now
        for check in &create.checks {
            self.compile_check(check, &table)?;
        }

        Ok(PlanNode::Sink(Arc::new(SinkPlan::CreateTable {
            table,
            if_not_exists: create.if_not_exists,
        })))
    }

    fn build_column_schema(&mut self, def: &ColumnDef) -> Result<ColumnSchema> {
        let mut column = ColumnSchema::new(&def.name, &def.declared_type);
        column.not_null = def.not_null;
        if let Some(name) = &def.collation {
            column.collation = Collation::resolve(name)?;
        }
        if let Some(default) = &def.default {
            column.default_value = Some(self.literal_value(default)?);
        }
        Ok(column)
    }

    /// Fold a default expression down to a literal
    fn literal_value(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => match self.literal_value(expr)? {
                Value::Integer(i) => Ok(Value::Integer(-i)),
                Value::Real(f) => Ok(Value::Real(-f)),
                other => Err(QuereusError::mismatch(format!(
                    "cannot negate default value {other}"
                ))),
            },
            _ => Err(QuereusError::unsupported(
                "DEFAULT must be a literal value",
            )),
        }
    }

    /// Compile a CHECK expression against a table's own columns
    pub(crate) fn compile_check(
        &mut self,
        check: &CheckDef,
        table: &Arc<TableSchema>,
    ) -> Result<ScalarPlan> {
        let node = next_plan_node_id();
        let attributes = table_attributes(table, node);
        let root = Scope::root();
        let scope = Scope::with_relations(
            &root,
            vec![RelationBinding::new(Some(&table.name), attributes)],
        );
        self.compile_expr(&check.expr, &scope).map_err(|err| {
            QuereusError::new(
                StatusCode::Error,
                format!("invalid CHECK constraint: {}", err.message),
            )
        })
    }

    fn build_create_index(&mut self, create: &CreateIndexStmt) -> Result<PlanNode> {
        if !create.if_not_exists && self.session.schema.read().index(&create.name).is_some() {
            return Err(QuereusError::misuse(format!(
                "index '{}' already exists",
                create.name
            )));
        }
        let table = self.session.schema.read().require_table(&create.table)?;
        let mut columns = Vec::with_capacity(create.columns.len());
        for (name, desc) in &create.columns {
            let position = table.column_index(name).ok_or_else(|| {
                QuereusError::not_found(format!("no such column: {}.{name}", table.name))
            })?;
            columns.push((
                position,
                if *desc { SortOrder::Desc } else { SortOrder::Asc },
            ));
        }
        Ok(PlanNode::Sink(Arc::new(SinkPlan::CreateIndex {
            index: Arc::new(IndexSchema {
                name: create.name.clone(),
                table_name: table.name.clone(),
                columns,
                unique: create.unique,
            }),
            if_not_exists: create.if_not_exists,
        })))
    }

    fn build_create_view(&mut self, create: &CreateViewStmt) -> Result<PlanNode> {
        if !create.if_not_exists && self.session.schema.read().view(&create.name).is_some() {
            return Err(QuereusError::misuse(format!(
                "view '{}' already exists",
                create.name
            )));
        }
        // Build once to surface resolution errors at DDL time
        let root = Scope::root();
        let plan = self.build_select(&create.select, &root)?;
        if let Some(names) = &create.column_names {
            if names.len() != plan.arity() {
                return Err(QuereusError::mismatch(format!(
                    "view '{}' declares {} columns but its SELECT produces {}",
                    create.name,
                    names.len(),
                    plan.arity()
                )));
            }
        }
        Ok(PlanNode::Sink(Arc::new(SinkPlan::CreateView {
            view: Arc::new(ViewSchema {
                schema_name: "main".to_string(),
                name: create.name.clone(),
                sql: create.select_sql.clone(),
                column_names: create.column_names.clone(),
            }),
            if_not_exists: create.if_not_exists,
        })))
    }
}

/// Attributes for a table's columns, produced by `node`
pub(crate) fn table_attributes(table: &TableSchema, node: crate::plan::PlanNodeId) -> Vec<Attribute> {
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

//! Sink plan nodes.
//!
//! Statements that produce no relational output: DDL, transaction
//! control, PRAGMA, and ANALYZE. Schema objects referenced by a sink
//! are resolved at build time so unknown names fail before execution.

use super::ScalarPlan;
use crate::schema::{IndexSchema, TableSchema, ViewSchema};
use std::fmt;
use std::sync::Arc;

/// A plan node producing no rows
#[derive(Debug)]
pub enum SinkPlan {
    CreateTable {
        table: Arc<TableSchema>,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    CreateIndex {
        index: Arc<IndexSchema>,
        if_not_exists: bool,
    },
    DropIndex {
        name: String,
        if_exists: bool,
    },
    CreateView {
        view: Arc<ViewSchema>,
        if_not_exists: bool,
    },
    DropView {
        name: String,
        if_exists: bool,
    },
    Begin,
    Commit,
    Rollback {
        to_savepoint: Option<String>,
    },
    Savepoint {
        name: String,
    },
    Release {
        name: String,
    },
    Pragma {
        name: String,
        value: Option<ScalarPlan>,
    },
    Analyze {
        /// `None` analyzes every table
        table: Option<Arc<TableSchema>>,
    },
}

/// Discriminant used by the emitter registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    CreateTable,
    DropTable,
    CreateIndex,
    DropIndex,
    CreateView,
    DropView,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    Pragma,
    Analyze,
}

impl SinkPlan {
    pub fn kind(&self) -> SinkKind {
        match self {
            SinkPlan::CreateTable { .. } => SinkKind::CreateTable,
            SinkPlan::DropTable { .. } => SinkKind::DropTable,
            SinkPlan::CreateIndex { .. } => SinkKind::CreateIndex,
            SinkPlan::DropIndex { .. } => SinkKind::DropIndex,
            SinkPlan::CreateView { .. } => SinkKind::CreateView,
            SinkPlan::DropView { .. } => SinkKind::DropView,
            SinkPlan::Begin => SinkKind::Begin,
            SinkPlan::Commit => SinkKind::Commit,
            SinkPlan::Rollback { .. } => SinkKind::Rollback,
            SinkPlan::Savepoint { .. } => SinkKind::Savepoint,
            SinkPlan::Release { .. } => SinkKind::Release,
            SinkPlan::Pragma { .. } => SinkKind::Pragma,
            SinkPlan::Analyze { .. } => SinkKind::Analyze,
        }
    }
}

impl fmt::Display for SinkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkPlan::CreateTable { table, .. } => write!(f, "CreateTable({})", table.name),
            SinkPlan::DropTable { name, .. } => write!(f, "DropTable({name})"),
            SinkPlan::CreateIndex { index, .. } => {
                write!(f, "CreateIndex({} on {})", index.name, index.table_name)
            }
            SinkPlan::DropIndex { name, .. } => write!(f, "DropIndex({name})"),
            SinkPlan::CreateView { view, .. } => write!(f, "CreateView({})", view.name),
            SinkPlan::DropView { name, .. } => write!(f, "DropView({name})"),
            SinkPlan::Begin => f.write_str("Begin"),
            SinkPlan::Commit => f.write_str("Commit"),
            SinkPlan::Rollback { to_savepoint: None } => f.write_str("Rollback"),
            SinkPlan::Rollback {
                to_savepoint: Some(name),
            } => write!(f, "RollbackTo({name})"),
            SinkPlan::Savepoint { name } => write!(f, "Savepoint({name})"),
            SinkPlan::Release { name } => write!(f, "Release({name})"),
            SinkPlan::Pragma { name, value } => {
                write!(f, "Pragma({name}, write={})", value.is_some())
            }
            SinkPlan::Analyze { table } => match table {
                Some(t) => write!(f, "Analyze({})", t.name),
                None => f.write_str("Analyze"),
            },
        }
    }
}

//! # SQL AST
//!
//! Statement and expression trees produced by the parser and consumed by
//! the planner. The AST is deliberately close to the SQL surface; all
//! name resolution, typing, and attribute assignment happen in the
//! planner.

use crate::error::SourceLocation;
use crate::value::Value;

/// A parsed SQL statement
#[derive(Debug, Clone)]
pub enum Stmt {
    CreateTable(CreateTableStmt),
    DropTable {
        name: String,
        if_exists: bool,
    },
    CreateIndex(CreateIndexStmt),
    DropIndex {
        name: String,
        if_exists: bool,
    },
    CreateView(CreateViewStmt),
    DropView {
        name: String,
        if_exists: bool,
    },
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Begin,
    Commit,
    Rollback {
        /// `ROLLBACK TO [SAVEPOINT] name`
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
        value: Option<Expr>,
    },
    Analyze {
        table: Option<String>,
    },
}

impl Stmt {
    /// Statements that produce no relational output
    pub fn is_sink(&self) -> bool {
        !matches!(self, Stmt::Select(_))
    }
}

/// One column definition inside CREATE TABLE
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type text; empty when omitted
    pub declared_type: String,
    pub primary_key: bool,
    pub not_null: bool,
    pub default: Option<Expr>,
    pub collation: Option<String>,
}

/// A CHECK constraint with its original source text
#[derive(Debug, Clone)]
pub struct CheckDef {
    pub name: Option<String>,
    pub expr: Expr,
    pub sql: String,
}

#[derive(Debug, Clone)]
pub struct CreateTableStmt {
    pub name: String,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnDef>,
    /// Table-level `PRIMARY KEY (a, b)` column names, if present
    pub primary_key: Option<Vec<String>>,
    pub checks: Vec<CheckDef>,
    /// `USING module(arg, ...)`; defaults to the engine's default module
    pub module: Option<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct CreateIndexStmt {
    pub name: String,
    pub table: String,
    pub if_not_exists: bool,
    pub unique: bool,
    /// (column name, descending)
    pub columns: Vec<(String, bool)>,
}

#[derive(Debug, Clone)]
pub struct CreateViewStmt {
    pub name: String,
    pub if_not_exists: bool,
    pub column_names: Option<Vec<String>>,
    pub select: SelectStmt,
    /// Original `SELECT ...` source, stored in the catalog
    pub select_sql: String,
}

#[derive(Debug, Clone)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Select(Box<SelectStmt>),
}

#[derive(Debug, Clone)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub source: InsertSource,
}

#[derive(Debug, Clone)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct DeleteStmt {
    pub table: String,
    pub where_clause: Option<Expr>,
}

/// A common table expression in a WITH clause
#[derive(Debug, Clone)]
pub struct CteDef {
    pub name: String,
    pub column_names: Option<Vec<String>>,
    /// `AS MATERIALIZED` / `AS NOT MATERIALIZED`; `None` leaves the
    /// choice to the planner
    pub materialized: Option<bool>,
    pub select: SelectStmt,
}

#[derive(Debug, Clone)]
pub struct SelectStmt {
    pub with: Vec<CteDef>,
    pub body: SelectBody,
    pub order_by: Vec<OrderingTerm>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum SelectBody {
    Select(SelectCore),
    Values(Vec<Vec<Expr>>),
    /// `UNION ALL` of two bodies
    UnionAll(Box<SelectBody>, Box<SelectBody>),
}

#[derive(Debug, Clone)]
pub struct SelectCore {
    pub distinct: bool,
    pub columns: Vec<ResultColumn>,
    pub from: Option<FromClause>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum ResultColumn {
    /// `*`
    Star,
    /// `alias.*`
    TableStar(String),
    Expr {
        expr: Expr,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FromClause {
    pub first: TableFactor,
    pub joins: Vec<Join>,
}

#[derive(Debug, Clone)]
pub enum TableFactor {
    Table {
        name: String,
        alias: Option<String>,
        loc: SourceLocation,
    },
    Subquery {
        select: Box<SelectStmt>,
        alias: Option<String>,
    },
}

impl TableFactor {
    /// The name this factor is visible under in the enclosing scope
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            TableFactor::Table { name, alias, .. } => Some(alias.as_deref().unwrap_or(name)),
            TableFactor::Subquery { alias, .. } => alias.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    Inner,
    LeftOuter,
    Cross,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub op: JoinOp,
    pub factor: TableFactor,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub desc: bool,
}

/// Parameter reference; positional parameters are numbered left to
/// right starting at 1, named parameters carry the trimmed name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamRef {
    Positional(usize),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Is
                | BinaryOp::IsNot
        )
    }
}

/// Window specification; only the empty `OVER ()` form is accepted
#[derive(Debug, Clone, Default)]
pub struct WindowSpec {}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Column {
        table: Option<String>,
        name: String,
        loc: SourceLocation,
    },
    Parameter(ParamRef),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        /// `count(*)`
        star: bool,
        distinct: bool,
        over: Option<WindowSpec>,
        loc: SourceLocation,
    },
    Case {
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        type_name: String,
    },
    Collate {
        expr: Box<Expr>,
        collation: String,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: Option<Box<Expr>>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSelect {
        expr: Box<Expr>,
        select: Box<SelectStmt>,
        negated: bool,
    },
    Exists {
        select: Box<SelectStmt>,
        negated: bool,
    },
    /// Scalar subquery
    Subquery(Box<SelectStmt>),
}

impl Expr {
    /// Whether this expression contains an aggregate function call
    /// (window calls do not count)
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Function {
                name, args, over, ..
            } => {
                (over.is_none() && is_aggregate_name(name))
                    || args.iter().any(Expr::contains_aggregate)
            }
            Expr::Unary { expr, .. }
            | Expr::Cast { expr, .. }
            | Expr::Collate { expr, .. }
            | Expr::IsNull { expr, .. } => expr.contains_aggregate(),
            Expr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::Case {
                operand,
                whens,
                else_expr,
            } => {
                operand.as_deref().is_some_and(Expr::contains_aggregate)
                    || whens
                        .iter()
                        .any(|(w, t)| w.contains_aggregate() || t.contains_aggregate())
                    || else_expr.as_deref().is_some_and(Expr::contains_aggregate)
            }
            Expr::Like { expr, pattern, .. } => {
                expr.contains_aggregate() || pattern.contains_aggregate()
            }
            Expr::InList { expr, list, .. } => {
                expr.contains_aggregate() || list.iter().any(Expr::contains_aggregate)
            }
            Expr::InSelect { expr, .. } => expr.contains_aggregate(),
            _ => false,
        }
    }
}

/// Names recognized as aggregate functions
pub fn is_aggregate_name(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "count" | "sum" | "avg" | "min" | "max" | "total"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::Column {
            table: None,
            name: name.to_string(),
            loc: SourceLocation { line: 1, column: 1 },
        }
    }

    #[test]
    fn test_contains_aggregate() {
        let agg = Expr::Function {
            name: "count".into(),
            args: vec![],
            star: true,
            distinct: false,
            over: None,
            loc: SourceLocation { line: 1, column: 1 },
        };
        let sum = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(agg),
            right: Box::new(col("x")),
        };
        assert!(sum.contains_aggregate());
        assert!(!col("x").contains_aggregate());
    }

    #[test]
    fn test_window_call_is_not_aggregate() {
        let win = Expr::Function {
            name: "row_number".into(),
            args: vec![],
            star: false,
            distinct: false,
            over: Some(WindowSpec::default()),
            loc: SourceLocation { line: 1, column: 1 },
        };
        assert!(!win.contains_aggregate());
    }

    #[test]
    fn test_binding_name() {
        let factor = TableFactor::Table {
            name: "users".into(),
            alias: Some("u".into()),
            loc: SourceLocation { line: 1, column: 1 },
        };
        assert_eq!(factor.binding_name(), Some("u"));
    }
}

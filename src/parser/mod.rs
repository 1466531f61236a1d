//! # SQL Parser
//!
//! Hand-rolled recursive-descent parser over the token stream from
//! [`lexer`]. Covers the statement surface the planner understands:
//! DDL, DML, SELECT with joins/grouping/ordering/limits, compound
//! `UNION ALL`, subqueries, non-recursive WITH, transaction control,
//! PRAGMA, and ANALYZE. Anonymous `?` parameters are numbered left to
//! right starting at 1; named parameters keep their trimmed name.
//!
//! ```text
//! SQL text -> [Lexer] -> tokens -> [Parser] -> ast::Stmt -> Planner
//! ```

pub mod lexer;

use crate::ast::*;
use crate::error::{QuereusError, Result, SourceLocation};
use crate::value::Value;
use lexer::{tokenize, Token, TokenKind};

/// Parse a multi-statement SQL program
pub fn parse_program(sql: &str) -> Result<Vec<Stmt>> {
    let mut parser = Parser::new(sql)?;
    let mut statements = Vec::new();
    loop {
        while parser.eat(&TokenKind::Semicolon) {}
        if parser.at_end() {
            break;
        }
        statements.push(parser.parse_statement()?);
        if !parser.at_end() && !parser.eat(&TokenKind::Semicolon) {
            return Err(parser.unexpected("';'"));
        }
    }
    Ok(statements)
}

/// Parse a single expression (used for stored CHECK constraints)
pub fn parse_expression(sql: &str) -> Result<Expr> {
    let mut parser = Parser::new(sql)?;
    let expr = parser.parse_expr()?;
    if !parser.at_end() {
        return Err(parser.unexpected("end of expression"));
    }
    Ok(expr)
}

/// Parse exactly one statement; trailing tokens are an error
pub fn parse_statement(sql: &str) -> Result<Stmt> {
    let mut statements = parse_program(sql)?;
    match statements.len() {
        0 => Err(QuereusError::syntax("empty statement", 1, 1)),
        1 => Ok(statements.remove(0)),
        _ => Err(QuereusError::misuse(
            "expected a single statement, found a program",
        )),
    }
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    next_positional: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self> {
        Ok(Parser {
            src,
            tokens: tokenize(src)?,
            pos: 0,
            next_positional: 0,
        })
    }

    // ------------------------------------------------------------------
    // Token utilities
    // ------------------------------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn bump(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn loc(&self) -> SourceLocation {
        self.peek().map_or(
            SourceLocation {
                line: u32::MAX,
                column: 1,
            },
            |t| SourceLocation {
                line: t.line,
                column: t.column,
            },
        )
    }

    fn unexpected(&self, wanted: &str) -> QuereusError {
        match self.peek() {
            Some(t) => QuereusError::syntax(
                format!("expected {wanted}, found {:?}", t.kind),
                t.line,
                t.column,
            ),
            None => {
                let (line, column) = self
                    .tokens
                    .last()
                    .map_or((1, 1), |t| (t.line, t.column));
                QuereusError::syntax(format!("expected {wanted}, found end of input"), line, column)
            }
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| t.kind == *kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, wanted: &str) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(wanted))
        }
    }

    /// Keyword check without consuming (case-insensitive, bare idents only)
    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Ident(name), .. }) if name.eq_ignore_ascii_case(kw))
    }

    fn at_kw_at(&self, ahead: usize, kw: &str) -> bool {
        matches!(self.peek_at(ahead), Some(Token { kind: TokenKind::Ident(name), .. }) if name.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{kw}'")))
        }
    }

    /// Consume an identifier (bare or quoted)
    fn ident(&mut self, wanted: &str) -> Result<String> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Ident(name)) | Some(TokenKind::QuotedIdent(name)) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected(wanted)),
        }
    }

    /// Source offset of the next token (for capturing expression text)
    fn offset(&self) -> usize {
        self.peek().map_or(self.src.len(), |t| t.offset)
    }

    /// End offset of the most recently consumed token
    fn prev_end(&self) -> usize {
        if self.pos == 0 {
            0
        } else {
            self.tokens[self.pos - 1].end_offset
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Stmt> {
        if self.at_kw("CREATE") {
            return self.parse_create();
        }
        if self.at_kw("DROP") {
            return self.parse_drop();
        }
        if self.at_kw("SELECT") || self.at_kw("VALUES") || self.at_kw("WITH") {
            return Ok(Stmt::Select(self.parse_select_stmt()?));
        }
        if self.eat_kw("INSERT") {
            return self.parse_insert();
        }
        if self.eat_kw("UPDATE") {
            return self.parse_update();
        }
        if self.eat_kw("DELETE") {
            return self.parse_delete();
        }
        if self.eat_kw("BEGIN") {
            // Optional transaction qualifiers are accepted and ignored
            let _ = self.eat_kw("DEFERRED") || self.eat_kw("IMMEDIATE") || self.eat_kw("EXCLUSIVE");
            let _ = self.eat_kw("TRANSACTION");
            return Ok(Stmt::Begin);
        }
        if self.eat_kw("COMMIT") || self.eat_kw("END") {
            let _ = self.eat_kw("TRANSACTION");
            return Ok(Stmt::Commit);
        }
        if self.eat_kw("ROLLBACK") {
            let _ = self.eat_kw("TRANSACTION");
            let to_savepoint = if self.eat_kw("TO") {
                let _ = self.eat_kw("SAVEPOINT");
                Some(self.ident("savepoint name")?)
            } else {
                None
            };
            return Ok(Stmt::Rollback { to_savepoint });
        }
        if self.eat_kw("SAVEPOINT") {
            return Ok(Stmt::Savepoint {
                name: self.ident("savepoint name")?,
            });
        }
        if self.eat_kw("RELEASE") {
            let _ = self.eat_kw("SAVEPOINT");
            return Ok(Stmt::Release {
                name: self.ident("savepoint name")?,
            });
        }
        if self.eat_kw("PRAGMA") {
            let name = self.ident("pragma name")?;
            let value = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr()?)
            } else if self.eat(&TokenKind::LParen) {
                let v = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Some(v)
            } else {
                None
            };
            return Ok(Stmt::Pragma { name, value });
        }
        if self.eat_kw("ANALYZE") {
            let table = if self.at_end() || self.peek().is_some_and(|t| t.kind == TokenKind::Semicolon)
            {
                None
            } else {
                Some(self.ident("table name")?)
            };
            return Ok(Stmt::Analyze { table });
        }
        Err(self.unexpected("a statement"))
    }

    fn parse_create(&mut self) -> Result<Stmt> {
        self.expect_kw("CREATE")?;
        if self.eat_kw("TABLE") {
            return self.parse_create_table();
        }
        if self.at_kw("UNIQUE") || self.at_kw("INDEX") {
            let unique = self.eat_kw("UNIQUE");
            self.expect_kw("INDEX")?;
            return self.parse_create_index(unique);
        }
        if self.eat_kw("VIEW") {
            return self.parse_create_view();
        }
        Err(self.unexpected("TABLE, INDEX, or VIEW"))
    }

    fn parse_if_not_exists(&mut self) -> Result<bool> {
        if self.eat_kw("IF") {
            self.expect_kw("NOT")?;
            self.expect_kw("EXISTS")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_create_table(&mut self) -> Result<Stmt> {
        let if_not_exists = self.parse_if_not_exists()?;
        let name = self.ident("table name")?;
        self.expect(&TokenKind::LParen, "'('")?;

        let mut columns = Vec::new();
        let mut primary_key = None;
        let mut checks = Vec::new();

        loop {
            if self.eat_kw("PRIMARY") {
                self.expect_kw("KEY")?;
                self.expect(&TokenKind::LParen, "'('")?;
                let mut cols = Vec::new();
                loop {
                    cols.push(self.ident("column name")?);
                    let _ = self.eat_kw("ASC");
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                if primary_key.is_some() {
                    return Err(self.unexpected("a single PRIMARY KEY clause"));
                }
                primary_key = Some(cols);
            } else if self.at_kw("CHECK") || (self.at_kw("CONSTRAINT") && self.at_kw_at(2, "CHECK"))
            {
                let constraint_name = if self.eat_kw("CONSTRAINT") {
                    Some(self.ident("constraint name")?)
                } else {
                    None
                };
                self.expect_kw("CHECK")?;
                checks.push(self.parse_check_body(constraint_name)?);
            } else if self.at_kw("FOREIGN") || self.at_kw("UNIQUE") {
                let t = self.loc();
                return Err(QuereusError::unsupported(
                    "FOREIGN KEY and UNIQUE table constraints are not supported",
                )
                .at(t));
            } else {
                columns.push(self.parse_column_def(&mut checks)?);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;

        let module = if self.eat_kw("USING") {
            let module_name = self.ident("module name")?;
            let mut args = Vec::new();
            if self.eat(&TokenKind::LParen) {
                if !self.eat(&TokenKind::RParen) {
                    loop {
                        args.push(self.module_arg()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen, "')'")?;
                }
            }
            Some((module_name, args))
        } else {
            None
        };

        Ok(Stmt::CreateTable(CreateTableStmt {
            name,
            if_not_exists,
            columns,
            primary_key,
            checks,
            module,
        }))
    }

    fn module_arg(&mut self) -> Result<String> {
        match self.bump().map(|t| (t.kind.clone(), t.line, t.column)) {
            Some((TokenKind::Ident(s) | TokenKind::QuotedIdent(s) | TokenKind::String(s), _, _)) => {
                Ok(s)
            }
            Some((TokenKind::Integer(i), _, _)) => Ok(i.to_string()),
            Some((kind, line, column)) => Err(QuereusError::syntax(
                format!("bad module argument: {kind:?}"),
                line,
                column,
            )),
            None => Err(self.unexpected("a module argument")),
        }
    }

    fn parse_check_body(&mut self, name: Option<String>) -> Result<CheckDef> {
        self.expect(&TokenKind::LParen, "'('")?;
        let start = self.offset();
        let expr = self.parse_expr()?;
        let sql = self.src[start..self.prev_end()].to_string();
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(CheckDef { name, expr, sql })
    }

    fn parse_column_def(&mut self, checks: &mut Vec<CheckDef>) -> Result<ColumnDef> {
        let name = self.ident("column name")?;

        // Declared type: identifiers possibly followed by (n) or (n, m)
        let mut declared_type = String::new();
        while let Some(Token {
            kind: TokenKind::Ident(word),
            ..
        }) = self.peek()
        {
            if is_column_constraint_keyword(word) {
                break;
            }
            if !declared_type.is_empty() {
                declared_type.push(' ');
            }
            declared_type.push_str(word);
            self.pos += 1;
        }
        if !declared_type.is_empty() && self.eat(&TokenKind::LParen) {
            // Size arguments do not affect affinity; swallow them
            let mut depth = 1;
            while depth > 0 {
                match self.bump().map(|t| &t.kind) {
                    Some(TokenKind::LParen) => depth += 1,
                    Some(TokenKind::RParen) => depth -= 1,
                    Some(_) => {}
                    None => return Err(self.unexpected("')'")),
                }
            }
        }

        let mut def = ColumnDef {
            name,
            declared_type,
            primary_key: false,
            not_null: false,
            default: None,
            collation: None,
        };

        loop {
            if self.eat_kw("PRIMARY") {
                self.expect_kw("KEY")?;
                let _ = self.eat_kw("ASC") || self.eat_kw("DESC");
                def.primary_key = true;
            } else if self.eat_kw("NOT") {
                self.expect_kw("NULL")?;
                def.not_null = true;
            } else if self.eat_kw("NULL") {
                // Explicit NULL marker; the default
            } else if self.eat_kw("DEFAULT") {
                let expr = if self.eat(&TokenKind::LParen) {
                    let e = self.parse_expr()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    e
                } else {
                    self.parse_unary()?
                };
                def.default = Some(expr);
            } else if self.eat_kw("COLLATE") {
                def.collation = Some(self.ident("collation name")?);
            } else if self.eat_kw("CHECK") {
                checks.push(self.parse_check_body(None)?);
            } else if self.at_kw("UNIQUE") || self.at_kw("REFERENCES") {
                let t = self.loc();
                return Err(QuereusError::unsupported(
                    "UNIQUE and REFERENCES column constraints are not supported",
                )
                .at(t));
            } else {
                break;
            }
        }
        Ok(def)
    }

    fn parse_create_index(&mut self, unique: bool) -> Result<Stmt> {
        let if_not_exists = self.parse_if_not_exists()?;
        let name = self.ident("index name")?;
        self.expect_kw("ON")?;
        let table = self.ident("table name")?;
        self.expect(&TokenKind::LParen, "'('")?;
        let mut columns = Vec::new();
        loop {
            let col = self.ident("column name")?;
            let desc = if self.eat_kw("DESC") {
                true
            } else {
                let _ = self.eat_kw("ASC");
                false
            };
            columns.push((col, desc));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(Stmt::CreateIndex(CreateIndexStmt {
            name,
            table,
            if_not_exists,
            unique,
            columns,
        }))
    }

    fn parse_create_view(&mut self) -> Result<Stmt> {
        let if_not_exists = self.parse_if_not_exists()?;
        let name = self.ident("view name")?;
        let column_names = if self.eat(&TokenKind::LParen) {
            let mut cols = Vec::new();
            loop {
                cols.push(self.ident("column name")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
            Some(cols)
        } else {
            None
        };
        self.expect_kw("AS")?;
        let start = self.offset();
        let select = self.parse_select_stmt()?;
        let select_sql = self.src[start..self.prev_end()].to_string();
        Ok(Stmt::CreateView(CreateViewStmt {
            name,
            if_not_exists,
            column_names,
            select,
            select_sql,
        }))
    }

    fn parse_drop(&mut self) -> Result<Stmt> {
        self.expect_kw("DROP")?;
        let kind = self.ident("TABLE, INDEX, or VIEW")?;
        let if_exists = if self.eat_kw("IF") {
            self.expect_kw("EXISTS")?;
            true
        } else {
            false
        };
        let name = self.ident("name")?;
        match kind.to_ascii_uppercase().as_str() {
            "TABLE" => Ok(Stmt::DropTable { name, if_exists }),
            "INDEX" => Ok(Stmt::DropIndex { name, if_exists }),
            "VIEW" => Ok(Stmt::DropView { name, if_exists }),
            _ => Err(self.unexpected("TABLE, INDEX, or VIEW")),
        }
    }

    fn parse_insert(&mut self) -> Result<Stmt> {
        self.expect_kw("INTO")?;
        let table = self.ident("table name")?;
        let columns = if self.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
            self.pos += 1;
            let mut cols = Vec::new();
            loop {
                cols.push(self.ident("column name")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
            Some(cols)
        } else {
            None
        };

        let source = if self.at_kw("VALUES") {
            self.pos += 1;
            InsertSource::Values(self.parse_values_rows()?)
        } else if self.at_kw("SELECT") || self.at_kw("WITH") {
            InsertSource::Select(Box::new(self.parse_select_stmt()?))
        } else {
            return Err(self.unexpected("VALUES or SELECT"));
        };

        Ok(Stmt::Insert(InsertStmt {
            table,
            columns,
            source,
        }))
    }

    fn parse_values_rows(&mut self) -> Result<Vec<Vec<Expr>>> {
        let mut rows = Vec::new();
        loop {
            self.expect(&TokenKind::LParen, "'('")?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
            rows.push(row);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(rows)
    }

    fn parse_update(&mut self) -> Result<Stmt> {
        let table = self.ident("table name")?;
        self.expect_kw("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.ident("column name")?;
            self.expect(&TokenKind::Eq, "'='")?;
            let value = self.parse_expr()?;
            assignments.push((column, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let where_clause = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Stmt::Update(UpdateStmt {
            table,
            assignments,
            where_clause,
        }))
    }

    fn parse_delete(&mut self) -> Result<Stmt> {
        self.expect_kw("FROM")?;
        let table = self.ident("table name")?;
        let where_clause = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Stmt::Delete(DeleteStmt {
            table,
            where_clause,
        }))
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn parse_select_stmt(&mut self) -> Result<SelectStmt> {
        let mut with = Vec::new();
        if self.eat_kw("WITH") {
            if self.at_kw("RECURSIVE") {
                let t = self.loc();
                return Err(
                    QuereusError::unsupported("recursive common table expressions").at(t)
                );
            }
            loop {
                with.push(self.parse_cte()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let body = self.parse_select_body()?;

        let order_by = if self.eat_kw("ORDER") {
            self.expect_kw("BY")?;
            let mut terms = Vec::new();
            loop {
                let expr = self.parse_expr()?;
                let desc = if self.eat_kw("DESC") {
                    true
                } else {
                    let _ = self.eat_kw("ASC");
                    false
                };
                terms.push(OrderingTerm { expr, desc });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            terms
        } else {
            Vec::new()
        };

        let (mut limit, mut offset) = (None, None);
        if self.eat_kw("LIMIT") {
            let first = self.parse_expr()?;
            if self.eat_kw("OFFSET") {
                limit = Some(first);
                offset = Some(self.parse_expr()?);
            } else if self.eat(&TokenKind::Comma) {
                // LIMIT offset, limit
                offset = Some(first);
                limit = Some(self.parse_expr()?);
            } else {
                limit = Some(first);
            }
        }

        Ok(SelectStmt {
            with,
            body,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_cte(&mut self) -> Result<CteDef> {
        let name = self.ident("CTE name")?;
        let column_names = if self.eat(&TokenKind::LParen) {
            let mut cols = Vec::new();
            loop {
                cols.push(self.ident("column name")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
            Some(cols)
        } else {
            None
        };
        self.expect_kw("AS")?;
        let materialized = if self.eat_kw("MATERIALIZED") {
            Some(true)
        } else if self.at_kw("NOT") && self.at_kw_at(1, "MATERIALIZED") {
            self.pos += 2;
            Some(false)
        } else {
            None
        };
        self.expect(&TokenKind::LParen, "'('")?;
        let select = self.parse_select_stmt()?;
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(CteDef {
            name,
            column_names,
            materialized,
            select,
        })
    }

    fn parse_select_body(&mut self) -> Result<SelectBody> {
        let mut body = self.parse_select_body_atom()?;
        while self.at_kw("UNION") {
            if !self.at_kw_at(1, "ALL") {
                let t = self.loc();
                return Err(QuereusError::unsupported(
                    "only UNION ALL compound selects are supported",
                )
                .at(t));
            }
            self.pos += 2;
            let right = self.parse_select_body_atom()?;
            body = SelectBody::UnionAll(Box::new(body), Box::new(right));
        }
        Ok(body)
    }

    fn parse_select_body_atom(&mut self) -> Result<SelectBody> {
        if self.eat_kw("VALUES") {
            return Ok(SelectBody::Values(self.parse_values_rows()?));
        }
        self.expect_kw("SELECT")?;
        let distinct = if self.eat_kw("DISTINCT") {
            true
        } else {
            let _ = self.eat_kw("ALL");
            false
        };

        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_result_column()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        let from = if self.eat_kw("FROM") {
            Some(self.parse_from_clause()?)
        } else {
            None
        };

        let where_clause = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        let mut having = None;
        if self.eat_kw("GROUP") {
            self.expect_kw("BY")?;
            loop {
                group_by.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            if self.eat_kw("HAVING") {
                having = Some(self.parse_expr()?);
            }
        }

        Ok(SelectBody::Select(SelectCore {
            distinct,
            columns,
            from,
            where_clause,
            group_by,
            having,
        }))
    }

    fn parse_result_column(&mut self) -> Result<ResultColumn> {
        if self.eat(&TokenKind::Star) {
            return Ok(ResultColumn::Star);
        }
        // alias.* form
        if let (Some(TokenKind::Ident(name) | TokenKind::QuotedIdent(name)), Some(TokenKind::Dot), Some(TokenKind::Star)) = (
            self.peek().map(|t| t.kind.clone()),
            self.peek_at(1).map(|t| t.kind.clone()),
            self.peek_at(2).map(|t| t.kind.clone()),
        ) {
            self.pos += 3;
            return Ok(ResultColumn::TableStar(name));
        }
        let expr = self.parse_expr()?;
        let alias = if self.eat_kw("AS") {
            Some(self.ident("alias")?)
        } else {
            match self.peek().map(|t| t.kind.clone()) {
                Some(TokenKind::Ident(name)) if !is_clause_keyword(&name) => {
                    self.pos += 1;
                    Some(name)
                }
                Some(TokenKind::QuotedIdent(name)) => {
                    self.pos += 1;
                    Some(name)
                }
                _ => None,
            }
        };
        Ok(ResultColumn::Expr { expr, alias })
    }

    fn parse_from_clause(&mut self) -> Result<FromClause> {
        let first = self.parse_table_factor()?;
        let mut joins = Vec::new();
        loop {
            let op = if self.eat(&TokenKind::Comma) {
                JoinOp::Cross
            } else if self.eat_kw("CROSS") {
                self.expect_kw("JOIN")?;
                JoinOp::Cross
            } else if self.eat_kw("INNER") {
                self.expect_kw("JOIN")?;
                JoinOp::Inner
            } else if self.eat_kw("LEFT") {
                let _ = self.eat_kw("OUTER");
                self.expect_kw("JOIN")?;
                JoinOp::LeftOuter
            } else if self.eat_kw("JOIN") {
                JoinOp::Inner
            } else if self.at_kw("RIGHT") || self.at_kw("FULL") {
                let t = self.loc();
                return Err(
                    QuereusError::unsupported("RIGHT and FULL joins are not supported").at(t)
                );
            } else {
                break;
            };
            let factor = self.parse_table_factor()?;
            let on = if self.eat_kw("ON") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            joins.push(Join { op, factor, on });
        }
        Ok(FromClause { first, joins })
    }

    fn parse_table_factor(&mut self) -> Result<TableFactor> {
        if self.eat(&TokenKind::LParen) {
            let select = Box::new(self.parse_select_stmt()?);
            self.expect(&TokenKind::RParen, "')'")?;
            let alias = self.parse_optional_alias()?;
            return Ok(TableFactor::Subquery { select, alias });
        }
        let loc = self.loc();
        let name = self.ident("table name")?;
        let alias = self.parse_optional_alias()?;
        Ok(TableFactor::Table { name, alias, loc })
    }

    fn parse_optional_alias(&mut self) -> Result<Option<String>> {
        if self.eat_kw("AS") {
            return Ok(Some(self.ident("alias")?));
        }
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Ident(name)) if !is_clause_keyword(&name) && !is_join_keyword(&name) => {
                self.pos += 1;
                Ok(Some(name))
            }
            Some(TokenKind::QuotedIdent(name)) => {
                self.pos += 1;
                Ok(Some(name))
            }
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_kw("OR") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_kw("AND") {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.at_kw("NOT") && !self.at_kw_at(1, "EXISTS") {
            self.pos += 1;
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Eq) => Some(BinaryOp::Eq),
                Some(TokenKind::Ne) => Some(BinaryOp::Ne),
                Some(TokenKind::Lt) => Some(BinaryOp::Lt),
                Some(TokenKind::Le) => Some(BinaryOp::Le),
                Some(TokenKind::Gt) => Some(BinaryOp::Gt),
                Some(TokenKind::Ge) => Some(BinaryOp::Ge),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 1;
                let right = self.parse_concat()?;
                left = Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
                continue;
            }

            if self.eat_kw("IS") {
                let negated = self.eat_kw("NOT");
                if self.eat_kw("NULL") {
                    left = Expr::IsNull {
                        expr: Box::new(left),
                        negated,
                    };
                } else {
                    let right = self.parse_concat()?;
                    left = Expr::Binary {
                        op: if negated { BinaryOp::IsNot } else { BinaryOp::Is },
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                }
                continue;
            }
            if self.eat_kw("ISNULL") {
                left = Expr::IsNull {
                    expr: Box::new(left),
                    negated: false,
                };
                continue;
            }
            if self.eat_kw("NOTNULL") {
                left = Expr::IsNull {
                    expr: Box::new(left),
                    negated: true,
                };
                continue;
            }

            let negated = if self.at_kw("NOT")
                && (self.at_kw_at(1, "LIKE") || self.at_kw_at(1, "IN") || self.at_kw_at(1, "BETWEEN"))
            {
                self.pos += 1;
                true
            } else {
                false
            };

            if self.eat_kw("LIKE") {
                let pattern = self.parse_concat()?;
                let escape = if self.eat_kw("ESCAPE") {
                    Some(Box::new(self.parse_concat()?))
                } else {
                    None
                };
                left = Expr::Like {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    escape,
                    negated,
                };
                continue;
            }
            if self.eat_kw("IN") {
                self.expect(&TokenKind::LParen, "'('")?;
                if self.at_kw("SELECT") || self.at_kw("WITH") || self.at_kw("VALUES") {
                    let select = Box::new(self.parse_select_stmt()?);
                    self.expect(&TokenKind::RParen, "')'")?;
                    left = Expr::InSelect {
                        expr: Box::new(left),
                        select,
                        negated,
                    };
                } else {
                    let mut list = Vec::new();
                    loop {
                        list.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen, "')'")?;
                    left = Expr::InList {
                        expr: Box::new(left),
                        list,
                        negated,
                    };
                }
                continue;
            }
            if self.eat_kw("BETWEEN") {
                let low = self.parse_concat()?;
                self.expect_kw("AND")?;
                let high = self.parse_concat()?;
                // x BETWEEN a AND b desugars to x >= a AND x <= b
                let ge = Expr::Binary {
                    op: BinaryOp::Ge,
                    left: Box::new(left.clone()),
                    right: Box::new(low),
                };
                let le = Expr::Binary {
                    op: BinaryOp::Le,
                    left: Box::new(left),
                    right: Box::new(high),
                };
                let both = Expr::Binary {
                    op: BinaryOp::And,
                    left: Box::new(ge),
                    right: Box::new(le),
                };
                left = if negated {
                    Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(both),
                    }
                } else {
                    both
                };
                continue;
            }

            if negated {
                return Err(self.unexpected("LIKE, IN, or BETWEEN after NOT"));
            }
            return Ok(left);
        }
    }

    fn parse_concat(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        while self.eat(&TokenKind::Concat) {
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op: BinaryOp::Concat,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.eat(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.eat(&TokenKind::Slash) {
                BinaryOp::Div
            } else if self.eat(&TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        if self.eat(&TokenKind::Plus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Plus,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.eat_kw("COLLATE") {
            let collation = self.ident("collation name")?;
            expr = Expr::Collate {
                expr: Box::new(expr),
                collation,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let loc = self.loc();

        // EXISTS / NOT EXISTS
        if self.at_kw("EXISTS") || (self.at_kw("NOT") && self.at_kw_at(1, "EXISTS")) {
            let negated = self.eat_kw("NOT");
            self.expect_kw("EXISTS")?;
            self.expect(&TokenKind::LParen, "'('")?;
            let select = Box::new(self.parse_select_stmt()?);
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Expr::Exists { select, negated });
        }

        if self.eat_kw("CASE") {
            let operand = if self.at_kw("WHEN") {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            let mut whens = Vec::new();
            while self.eat_kw("WHEN") {
                let when = self.parse_expr()?;
                self.expect_kw("THEN")?;
                let then = self.parse_expr()?;
                whens.push((when, then));
            }
            if whens.is_empty() {
                return Err(self.unexpected("WHEN"));
            }
            let else_expr = if self.eat_kw("ELSE") {
                Some(Box::new(self.parse_expr()?))
            } else {
                None
            };
            self.expect_kw("END")?;
            return Ok(Expr::Case {
                operand,
                whens,
                else_expr,
            });
        }

        if self.eat_kw("CAST") {
            self.expect(&TokenKind::LParen, "'('")?;
            let expr = self.parse_expr()?;
            self.expect_kw("AS")?;
            let mut type_name = self.ident("type name")?;
            while let Some(Token {
                kind: TokenKind::Ident(word),
                ..
            }) = self.peek()
            {
                let word = word.clone();
                self.pos += 1;
                type_name.push(' ');
                type_name.push_str(&word);
            }
            if self.eat(&TokenKind::LParen) {
                while !self.eat(&TokenKind::RParen) {
                    if self.bump().is_none() {
                        return Err(self.unexpected("')'"));
                    }
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Expr::Cast {
                expr: Box::new(expr),
                type_name,
            });
        }

        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Integer(i)) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Integer(i)))
            }
            Some(TokenKind::Float(f)) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Real(f)))
            }
            Some(TokenKind::String(s)) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Text(s)))
            }
            Some(TokenKind::Blob(b)) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Blob(b)))
            }
            Some(TokenKind::Question) => {
                self.pos += 1;
                self.next_positional += 1;
                Ok(Expr::Parameter(ParamRef::Positional(self.next_positional)))
            }
            Some(TokenKind::NamedParam(name)) => {
                self.pos += 1;
                Ok(Expr::Parameter(ParamRef::Named(name)))
            }
            Some(TokenKind::LParen) => {
                self.pos += 1;
                if self.at_kw("SELECT") || self.at_kw("WITH") || self.at_kw("VALUES") {
                    let select = Box::new(self.parse_select_stmt()?);
                    self.expect(&TokenKind::RParen, "')'")?;
                    return Ok(Expr::Subquery(select));
                }
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            Some(TokenKind::Ident(name)) | Some(TokenKind::QuotedIdent(name)) => {
                self.pos += 1;
                match name.to_ascii_uppercase().as_str() {
                    "NULL" => return Ok(Expr::Literal(Value::Null)),
                    "TRUE" => return Ok(Expr::Literal(Value::Integer(1))),
                    "FALSE" => return Ok(Expr::Literal(Value::Integer(0))),
                    _ => {}
                }

                // Function call
                if self.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
                    self.pos += 1;
                    return self.parse_function_tail(name, loc);
                }

                // table.column
                if self.eat(&TokenKind::Dot) {
                    let column = self.ident("column name")?;
                    return Ok(Expr::Column {
                        table: Some(name),
                        name: column,
                        loc,
                    });
                }
                Ok(Expr::Column {
                    table: None,
                    name,
                    loc,
                })
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_function_tail(&mut self, name: String, loc: SourceLocation) -> Result<Expr> {
        let mut star = false;
        let mut distinct = false;
        let mut args = Vec::new();
        if self.eat(&TokenKind::Star) {
            star = true;
            self.expect(&TokenKind::RParen, "')'")?;
        } else if self.eat(&TokenKind::RParen) {
            // zero arguments
        } else {
            distinct = self.eat_kw("DISTINCT");
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
        }

        let over = if self.eat_kw("OVER") {
            self.expect(&TokenKind::LParen, "'('")?;
            if !self.eat(&TokenKind::RParen) {
                let t = self.loc();
                return Err(QuereusError::unsupported(
                    "window specifications beyond OVER () are not supported",
                )
                .at(t));
            }
            Some(WindowSpec::default())
        } else {
            None
        };

        Ok(Expr::Function {
            name,
            args,
            star,
            distinct,
            over,
            loc,
        })
    }
}

/// Keywords terminating a column definition's declared type
fn is_column_constraint_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "PRIMARY" | "NOT" | "NULL" | "DEFAULT" | "COLLATE" | "CHECK" | "UNIQUE" | "REFERENCES"
    )
}

/// Keywords that end an implicit alias position
fn is_clause_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "FROM"
            | "WHERE"
            | "GROUP"
            | "HAVING"
            | "ORDER"
            | "LIMIT"
            | "OFFSET"
            | "UNION"
            | "ON"
            | "USING"
            | "AS"
            | "SET"
            | "VALUES"
    )
}

fn is_join_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "JOIN" | "INNER" | "LEFT" | "RIGHT" | "FULL" | "CROSS" | "OUTER" | "NATURAL"
    )
}

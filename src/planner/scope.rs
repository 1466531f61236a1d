//! Name-resolution scopes.
//!
//! A scope is a chain: the global (catalog) scope at the root, then a
//! relation scope per query level. Lookup walks outward, which is what
//! makes correlated subqueries see their outer query's columns. A name
//! matching two relations at the same level is ambiguous; matches at
//! different levels shadow.

use crate::error::{QuereusError, Result, SourceLocation, StatusCode};
use crate::plan::Attribute;

/// One FROM-level binding: a named (or anonymous) relation and the
/// attributes it exposes
#[derive(Debug, Clone)]
pub struct RelationBinding {
    /// Binding name (alias or table name), lowercase; `None` for
    /// anonymous subqueries
    pub name: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl RelationBinding {
    pub fn new(name: Option<&str>, attributes: Vec<Attribute>) -> Self {
        RelationBinding {
            name: name.map(str::to_ascii_lowercase),
            attributes,
        }
    }
}

/// A link in the resolution chain
#[derive(Debug, Default)]
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    relations: Vec<RelationBinding>,
}

impl<'a> Scope<'a> {
    /// The root scope: no relations, names fall through to errors
    pub fn root() -> Scope<'static> {
        Scope {
            parent: None,
            relations: Vec::new(),
        }
    }

    /// A nested scope exposing `relations`, falling back to `parent`
    pub fn with_relations(parent: &'a Scope<'a>, relations: Vec<RelationBinding>) -> Scope<'a> {
        Scope {
            parent: Some(parent),
            relations,
        }
    }

    pub fn relations(&self) -> &[RelationBinding] {
        &self.relations
    }

    /// Attributes of the binding with the given name, if present at
    /// this level
    pub fn binding(&self, name: &str) -> Option<&RelationBinding> {
        let wanted = name.to_ascii_lowercase();
        self.relations
            .iter()
            .find(|r| r.name.as_deref() == Some(wanted.as_str()))
    }

    /// Resolve a possibly-qualified column reference to an attribute
    pub fn resolve(
        &self,
        table: Option<&str>,
        column: &str,
        loc: SourceLocation,
    ) -> Result<Attribute> {
        let mut level: Option<&Scope<'_>> = Some(self);
        while let Some(scope) = level {
            let mut matches: Vec<&Attribute> = Vec::new();
            for relation in &scope.relations {
                if let Some(qualifier) = table {
                    if relation.name.as_deref() != Some(qualifier.to_ascii_lowercase().as_str()) {
                        continue;
                    }
                }
                matches.extend(
                    relation
                        .attributes
                        .iter()
                        .filter(|a| a.name.eq_ignore_ascii_case(column)),
                );
            }
            match matches.len() {
                0 => level = scope.parent,
                1 => return Ok(matches[0].clone()),
                _ => {
                    return Err(QuereusError::new(
                        StatusCode::Ambiguous,
                        format!("ambiguous column name: {column}"),
                    )
                    .at(loc))
                }
            }
        }
        let rendered = match table {
            Some(t) => format!("{t}.{column}"),
            None => column.to_string(),
        };
        Err(QuereusError::not_found(format!("no such column: {rendered}")).at(loc))
    }
}

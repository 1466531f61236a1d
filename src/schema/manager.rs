//! Schema manager: registration and lookup of catalog objects.
//!
//! Lookups are case-insensitive. Every mutation bumps a generation
//! counter and notifies subscribers, so hosts (and the runtime's
//! captured-schema validation) can detect DDL churn.

use super::{FunctionSchema, IndexSchema, TableSchema, ViewSchema};
use crate::error::{QuereusError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A catalog change notification
#[derive(Debug, Clone, Serialize)]
pub enum SchemaChange {
    TableCreated { name: String },
    TableDropped { name: String },
    IndexCreated { name: String, table: String },
    IndexDropped { name: String },
    ViewCreated { name: String },
    ViewDropped { name: String },
    FunctionRegistered { name: String },
}

/// Catalog of tables, indexes, views, and functions
pub struct SchemaManager {
    tables: HashMap<String, Arc<TableSchema>>,
    indexes: HashMap<String, Arc<IndexSchema>>,
    views: HashMap<String, Arc<ViewSchema>>,
    /// Keyed by lowercase name; arity overloads share one entry list
    functions: HashMap<String, Vec<Arc<FunctionSchema>>>,
    generation: u64,
    subscribers: Vec<Sender<SchemaChange>>,
}

impl SchemaManager {
    pub fn new() -> Self {
        SchemaManager {
            tables: HashMap::new(),
            indexes: HashMap::new(),
            views: HashMap::new(),
            functions: HashMap::new(),
            generation: 0,
            subscribers: Vec::new(),
        }
    }

    /// Monotonic counter bumped on every catalog change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Subscribe to catalog change notifications
    pub fn subscribe(&mut self) -> Receiver<SchemaChange> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, change: SchemaChange) {
        self.generation += 1;
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    pub fn register_table(&mut self, table: Arc<TableSchema>) -> Result<Arc<TableSchema>> {
        let key = table.name.to_ascii_lowercase();
        if self.tables.contains_key(&key) {
            return Err(QuereusError::misuse(format!(
                "table '{}' already exists",
                table.name
            )));
        }
        if self.views.contains_key(&key) {
            return Err(QuereusError::misuse(format!(
                "a view named '{}' already exists",
                table.name
            )));
        }
        let name = table.name.clone();
        self.tables.insert(key, Arc::clone(&table));
        self.notify(SchemaChange::TableCreated { name });
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn require_table(&self, name: &str) -> Result<Arc<TableSchema>> {
        self.table(name)
            .ok_or_else(|| QuereusError::not_found(format!("no such table: {name}")))
    }

    pub fn drop_table(&mut self, name: &str) -> Result<Arc<TableSchema>> {
        let key = name.to_ascii_lowercase();
        let table = self
            .tables
            .remove(&key)
            .ok_or_else(|| QuereusError::not_found(format!("no such table: {name}")))?;
        // Indexes over the table go with it
        let doomed: Vec<String> = self
            .indexes
            .values()
            .filter(|i| i.table_name.eq_ignore_ascii_case(name))
            .map(|i| i.name.clone())
            .collect();
        for index_name in doomed {
            self.indexes.remove(&index_name.to_ascii_lowercase());
        }
        self.notify(SchemaChange::TableDropped {
            name: table.name.clone(),
        });
        Ok(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.values().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    pub fn register_index(&mut self, index: Arc<IndexSchema>) -> Result<Arc<IndexSchema>> {
        let key = index.name.to_ascii_lowercase();
        if self.indexes.contains_key(&key) {
            return Err(QuereusError::misuse(format!(
                "index '{}' already exists",
                index.name
            )));
        }
        self.require_table(&index.table_name)?;
        self.indexes.insert(key, Arc::clone(&index));
        self.notify(SchemaChange::IndexCreated {
            name: index.name.clone(),
            table: index.table_name.clone(),
        });
        Ok(index)
    }

    pub fn index(&self, name: &str) -> Option<Arc<IndexSchema>> {
        self.indexes.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn drop_index(&mut self, name: &str) -> Result<Arc<IndexSchema>> {
        let index = self
            .indexes
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| QuereusError::not_found(format!("no such index: {name}")))?;
        self.notify(SchemaChange::IndexDropped {
            name: index.name.clone(),
        });
        Ok(index)
    }

    /// All indexes registered over a table
    pub fn indexes_for_table(&self, table: &str) -> Vec<Arc<IndexSchema>> {
        let mut found: Vec<Arc<IndexSchema>> = self
            .indexes
            .values()
            .filter(|i| i.table_name.eq_ignore_ascii_case(table))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn register_view(&mut self, view: Arc<ViewSchema>) -> Result<Arc<ViewSchema>> {
        let key = view.name.to_ascii_lowercase();
        if self.views.contains_key(&key) || self.tables.contains_key(&key) {
            return Err(QuereusError::misuse(format!(
                "'{}' already exists",
                view.name
            )));
        }
        self.views.insert(key, Arc::clone(&view));
        self.notify(SchemaChange::ViewCreated {
            name: view.name.clone(),
        });
        Ok(view)
    }

    pub fn view(&self, name: &str) -> Option<Arc<ViewSchema>> {
        self.views.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn drop_view(&mut self, name: &str) -> Result<Arc<ViewSchema>> {
        let view = self
            .views
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| QuereusError::not_found(format!("no such view: {name}")))?;
        self.notify(SchemaChange::ViewDropped {
            name: view.name.clone(),
        });
        Ok(view)
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    pub fn register_function(&mut self, function: FunctionSchema) {
        let key = function.name.to_ascii_lowercase();
        let entry = self.functions.entry(key).or_default();
        // Re-registration with the same arity replaces
        entry.retain(|f| f.arity != function.arity);
        let name = function.name.clone();
        entry.push(Arc::new(function));
        self.notify(SchemaChange::FunctionRegistered { name });
    }

    /// Resolve a function by name and argument count
    pub fn function(&self, name: &str, argc: usize) -> Option<Arc<FunctionSchema>> {
        let candidates = self.functions.get(&name.to_ascii_lowercase())?;
        // Exact arity beats variadic
        candidates
            .iter()
            .find(|f| f.arity == Some(argc))
            .or_else(|| candidates.iter().find(|f| f.accepts(argc)))
            .cloned()
    }
}

impl Default for SchemaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::value::Value;

    fn table(name: &str) -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            name,
            "memory",
            vec![ColumnSchema::new("id", "INTEGER")],
            vec![0],
        ))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut mgr = SchemaManager::new();
        mgr.register_table(table("T1")).expect("register");
        assert!(mgr.table("t1").is_some());
        assert!(mgr.require_table("T1").is_ok());
        assert!(mgr.require_table("t2").is_err());
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut mgr = SchemaManager::new();
        mgr.register_table(table("t")).expect("register");
        assert!(mgr.register_table(table("T")).is_err());
    }

    #[test]
    fn test_drop_table_cascades_indexes() {
        let mut mgr = SchemaManager::new();
        mgr.register_table(table("t")).expect("register");
        mgr.register_index(Arc::new(IndexSchema {
            name: "t_idx".into(),
            table_name: "t".into(),
            columns: vec![(0, crate::schema::SortOrder::Asc)],
            unique: false,
        }))
        .expect("index");
        assert!(mgr.index("t_idx").is_some());
        mgr.drop_table("t").expect("drop");
        assert!(mgr.index("t_idx").is_none());
    }

    #[test]
    fn test_generation_bumps_on_change() {
        let mut mgr = SchemaManager::new();
        let g0 = mgr.generation();
        mgr.register_table(table("t")).expect("register");
        assert!(mgr.generation() > g0);
    }

    #[test]
    fn test_change_notifications() {
        let mut mgr = SchemaManager::new();
        let rx = mgr.subscribe();
        mgr.register_table(table("t")).expect("register");
        match rx.try_recv() {
            Ok(SchemaChange::TableCreated { name }) => assert_eq!(name, "t"),
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_identity_survives_lookup() {
        let mut mgr = SchemaManager::new();
        let registered = mgr.register_table(table("t")).expect("register");
        let found = mgr.table("t").expect("lookup");
        assert!(Arc::ptr_eq(&registered, &found));
    }

    #[test]
    fn test_function_overload_resolution() {
        let mut mgr = SchemaManager::new();
        mgr.register_function(FunctionSchema::scalar("f", Some(1), |_| {
            Ok(Value::Integer(1))
        }));
        mgr.register_function(FunctionSchema::scalar("f", None, |_| Ok(Value::Integer(2))));
        let exact = mgr.function("F", 1).expect("exact");
        assert_eq!(exact.arity, Some(1));
        let variadic = mgr.function("f", 3).expect("variadic");
        assert_eq!(variadic.arity, None);
        assert!(mgr.function("g", 0).is_none());
    }
}

//! # Session State
//!
//! Everything a database handle shares between its planner, runtime,
//! and transaction coordinator: the schema catalog, the module
//! registry, pooled open tables, per-handle options, and the change
//! bus. A session (and everything that borrows it) is single-threaded;
//! the catalog and module registry use sync primitives only so schema
//! objects can be shared with module implementations.

use crate::config::Config;
use crate::error::{QuereusError, Result};
use crate::events::DataChangeBus;
use crate::functions::register_builtins;
use crate::schema::{IndexSchema, SchemaManager, TableSchema};
use crate::txn::TransactionCoordinator;
use crate::value::Value;
use crate::vtab::{memory::MemoryTableModule, VirtualTable, VirtualTableModule};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Option names `set_option`/`get_option` recognize; writes to other
/// names are silently ignored, reads of them are errors
const KNOWN_OPTIONS: &[&str] = &["default_vtab_module", "statement_timeout_ms"];

/// Shared state of one database handle
pub struct Session {
    pub schema: RwLock<SchemaManager>,
    modules: DashMap<String, Arc<dyn VirtualTableModule>>,
    /// Open tables pooled for the lifetime of the handle
    tables: RefCell<HashMap<String, Arc<dyn VirtualTable>>>,
    pub txn: RefCell<TransactionCoordinator>,
    pub bus: Arc<DataChangeBus>,
    options: RefCell<HashMap<String, Value>>,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        let mut schema = SchemaManager::new();
        register_builtins(&mut schema);

        let bus = Arc::new(DataChangeBus::new());
        let session = Session {
            schema: RwLock::new(schema),
            modules: DashMap::new(),
            tables: RefCell::new(HashMap::new()),
            txn: RefCell::new(TransactionCoordinator::new(Arc::clone(&bus))),
            bus,
            options: RefCell::new(HashMap::new()),
        };
        session.register_module(
            crate::vtab::memory::MEMORY_MODULE,
            Arc::new(MemoryTableModule::new()),
        );
        session.options.borrow_mut().insert(
            "default_vtab_module".to_string(),
            Value::Text(config.engine.default_module.clone()),
        );
        session.options.borrow_mut().insert(
            "statement_timeout_ms".to_string(),
            Value::Integer(config.engine.statement_timeout_ms as i64),
        );
        session
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    pub fn register_module(&self, name: &str, module: Arc<dyn VirtualTableModule>) {
        self.modules.insert(name.to_ascii_lowercase(), module);
    }

    pub fn module(&self, name: &str) -> Result<Arc<dyn VirtualTableModule>> {
        self.modules
            .get(&name.to_ascii_lowercase())
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| QuereusError::not_found(format!("no such module: {name}")))
    }

    /// Module used when CREATE TABLE has no USING clause
    pub fn default_module_name(&self) -> String {
        match self.options.borrow().get("default_vtab_module") {
            Some(Value::Text(name)) => name.clone(),
            _ => crate::vtab::memory::MEMORY_MODULE.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    fn pool_key(table: &TableSchema) -> String {
        format!(
            "{}.{}",
            table.schema_name.to_ascii_lowercase(),
            table.name.to_ascii_lowercase()
        )
    }

    /// Open (or reuse) the virtual table backing a schema entry
    pub fn open_table(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        let key = Self::pool_key(schema);
        if let Some(table) = self.tables.borrow().get(&key) {
            return Ok(Arc::clone(table));
        }
        let module = self.module(&schema.module_name)?;
        let table = module.connect(schema)?;
        self.tables.borrow_mut().insert(key, Arc::clone(&table));
        Ok(table)
    }

    /// Register a new table and create its storage
    pub fn create_table(&self, schema: Arc<TableSchema>) -> Result<()> {
        let module = self.module(&schema.module_name)?;
        let registered = self.schema.write().register_table(Arc::clone(&schema))?;
        match module.create(&registered, &[]) {
            Ok(table) => {
                self.tables
                    .borrow_mut()
                    .insert(Self::pool_key(&registered), table);
                Ok(())
            }
            Err(err) => {
                let _ = self.schema.write().drop_table(&registered.name);
                Err(err)
            }
        }
    }

    /// Drop a table: catalog entry, pooled handle, and storage
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self.schema.write().drop_table(name)?;
        if let Some(open) = self.tables.borrow_mut().remove(&Self::pool_key(&table)) {
            open.disconnect()?;
        }
        let module = self.module(&table.module_name)?;
        module.destroy(&table)?;
        debug!(table = name, "table dropped");
        Ok(())
    }

    /// Register a secondary index and notify the open table
    pub fn create_index(&self, index: Arc<IndexSchema>) -> Result<()> {
        let table_schema = self.schema.read().require_table(&index.table_name)?;
        self.schema.write().register_index(Arc::clone(&index))?;
        let table = self.open_table(&table_schema)?;
        table.index_created(&index)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let index = self.schema.write().drop_index(name)?;
        if let Ok(table_schema) = self.schema.read().require_table(&index.table_name) {
            let table = self.open_table(&table_schema)?;
            table.index_dropped(&index.name)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// Set a handle option; unknown names are ignored
    pub fn set_option(&self, name: &str, value: Value) {
        let key = name.to_ascii_lowercase();
        if KNOWN_OPTIONS.contains(&key.as_str()) {
            self.options.borrow_mut().insert(key, value);
        } else {
            debug!(option = name, "ignoring unknown option write");
        }
    }

    /// Read a handle option; unknown names are errors
    pub fn get_option(&self, name: &str) -> Result<Value> {
        let key = name.to_ascii_lowercase();
        if !KNOWN_OPTIONS.contains(&key.as_str()) {
            return Err(QuereusError::misuse(format!("unknown option: {name}")));
        }
        Ok(self
            .options
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Statement timeout from options (0 or unset = none)
    pub fn statement_timeout(&self) -> Option<std::time::Duration> {
        match self.options.borrow().get("statement_timeout_ms") {
            Some(value) => match value.as_integer() {
                Some(ms) if ms > 0 => Some(std::time::Duration::from_millis(ms as u64)),
                _ => None,
            },
            None => None,
        }
    }

    /// Shut the handle down: roll back open work and release tables
    pub fn close(&self) -> Result<()> {
        {
            let mut txn = self.txn.borrow_mut();
            if txn.is_in_transaction() {
                txn.rollback()?;
            }
            txn.disconnect_all()?;
        }
        for (_, table) in self.tables.borrow_mut().drain() {
            table.disconnect()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    fn session() -> Session {
        Session::new(&Config::default())
    }

    fn users() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            "users",
            "memory",
            vec![ColumnSchema::new("id", "INTEGER")],
            vec![0],
        ))
    }

    #[test]
    fn test_memory_module_registered_by_default() {
        let s = session();
        assert!(s.module("memory").is_ok());
        assert!(s.module("missing").is_err());
        assert_eq!(s.default_module_name(), "memory");
    }

    #[test]
    fn test_create_and_open_table_pools_handle() {
        let s = session();
        s.create_table(users()).expect("create");
        let schema = s.schema.read().require_table("users").expect("schema");
        let a = s.open_table(&schema).expect("open");
        let b = s.open_table(&schema).expect("open again");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_drop_table_clears_pool_and_storage() {
        let s = session();
        s.create_table(users()).expect("create");
        s.drop_table("users").expect("drop");
        assert!(s.schema.read().table("users").is_none());
        // Recreating succeeds because the module storage is gone too
        s.create_table(users()).expect("recreate");
    }

    #[test]
    fn test_unknown_option_write_is_ignored_read_errors() {
        let s = session();
        s.set_option("no_such_option", Value::Integer(1));
        let err = s.get_option("no_such_option").expect_err("read must fail");
        assert_eq!(err.code, crate::error::StatusCode::Misuse);

        s.set_option("statement_timeout_ms", Value::Integer(250));
        assert_eq!(
            s.get_option("statement_timeout_ms").expect("read"),
            Value::Integer(250)
        );
        assert_eq!(
            s.statement_timeout(),
            Some(std::time::Duration::from_millis(250))
        );
    }

    #[test]
    fn test_builtin_functions_present() {
        let s = session();
        assert!(s.schema.read().function("coalesce", 3).is_some());
        assert!(s.schema.read().function("lower", 1).is_some());
    }
}

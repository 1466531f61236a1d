//! # Transaction Coordinator
//!
//! One logical transaction spanning every virtual table touched by the
//! statement program. Connections enlist lazily on first touch; an
//! enlisting connection receives `begin` plus a replay of the
//! savepoints already on the stack, so a table first written after
//! `SAVEPOINT a` still honors a later `ROLLBACK TO a`.
//!
//! Commit flushes every participant; a failure in any table aborts the
//! whole commit and rolls everything back. Committed changes buffered
//! by the connections are broadcast on the change bus afterwards.
//! Rollback discards overlays and emits nothing.

use crate::error::{QuereusError, Result};
use crate::events::DataChangeBus;
use crate::vtab::VirtualTableConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct SavepointRecord {
    index: u32,
    name: String,
}

/// Coordinates BEGIN/COMMIT/ROLLBACK and nested savepoints across
/// enlisted virtual-table connections
pub struct TransactionCoordinator {
    /// Connection pool, keyed by lowercase table name; connections
    /// outlive transactions and are reused
    connections: HashMap<String, Box<dyn VirtualTableConnection>>,
    /// Tables participating in the open transaction
    participants: Vec<String>,
    active: bool,
    /// Opened by BEGIN (or SAVEPOINT) rather than implicitly
    explicit: bool,
    savepoints: Vec<SavepointRecord>,
    next_savepoint_index: u32,
    bus: Arc<DataChangeBus>,
}

impl TransactionCoordinator {
    pub fn new(bus: Arc<DataChangeBus>) -> Self {
        TransactionCoordinator {
            connections: HashMap::new(),
            participants: Vec::new(),
            active: false,
            explicit: false,
            savepoints: Vec::new(),
            next_savepoint_index: 0,
            bus,
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.active
    }

    /// Whether the open transaction was started with BEGIN/SAVEPOINT
    pub fn is_explicit(&self) -> bool {
        self.active && self.explicit
    }

    /// Explicit BEGIN
    pub fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(QuereusError::misuse(
                "cannot start a transaction within a transaction",
            ));
        }
        self.active = true;
        self.explicit = true;
        debug!("transaction opened (explicit)");
        Ok(())
    }

    /// Implicit BEGIN issued by DML/DDL when no transaction is open
    pub fn ensure_transaction(&mut self) {
        if !self.active {
            self.active = true;
            self.explicit = false;
            debug!("transaction opened (implicit)");
        }
    }

    /// Enlist a table's connection in the open transaction, creating it
    /// through `open` on first touch of the database handle
    pub fn enlist(
        &mut self,
        table_name: &str,
        open: impl FnOnce() -> Result<Box<dyn VirtualTableConnection>>,
    ) -> Result<&dyn VirtualTableConnection> {
        if !self.active {
            return Err(QuereusError::internal(
                "enlist called outside a transaction",
            ));
        }
        let key = table_name.to_ascii_lowercase();
        if !self.connections.contains_key(&key) {
            self.connections.insert(key.clone(), open()?);
        }
        if !self.participants.contains(&key) {
            let conn = self
                .connections
                .get(&key)
                .ok_or_else(|| QuereusError::internal("connection vanished during enlist"))?;
            conn.begin()?;
            // A late joiner must observe the savepoints already open
            for record in &self.savepoints {
                conn.create_savepoint(record.index)?;
            }
            self.participants.push(key.clone());
            debug!(table = table_name, "connection enlisted");
        }
        self.connections
            .get(&key)
            .map(|c| c.as_ref())
            .ok_or_else(|| QuereusError::internal("connection vanished during enlist"))
    }

    /// The enlisted connection for a table, if any
    pub fn connection(&self, table_name: &str) -> Option<&dyn VirtualTableConnection> {
        let key = table_name.to_ascii_lowercase();
        if self.participants.contains(&key) {
            self.connections.get(&key).map(|c| c.as_ref())
        } else {
            None
        }
    }

    /// Commit all participants atomically; broadcast their buffered
    /// changes afterwards
    pub fn commit(&mut self) -> Result<()> {
        if !self.active {
            return Err(QuereusError::misuse("no transaction is open"));
        }
        for (position, key) in self.participants.iter().enumerate() {
            let Some(conn) = self.connections.get(key) else {
                continue;
            };
            if let Err(err) = conn.commit() {
                // Unwind: participants not yet committed are rolled back
                for other in self.participants.iter().skip(position + 1) {
                    if let Some(conn) = self.connections.get(other) {
                        let _ = conn.rollback();
                    }
                }
                let key = key.clone();
                self.reset();
                return Err(QuereusError::from_vtab(&key, err));
            }
        }

        let mut changes = Vec::new();
        for key in &self.participants {
            if let Some(conn) = self.connections.get(key) {
                changes.extend(conn.take_pending_changes());
            }
        }
        debug!(
            participants = self.participants.len(),
            changes = changes.len(),
            "transaction committed"
        );
        self.reset();
        self.bus.broadcast(&changes);
        Ok(())
    }

    /// Discard every participant's overlay; no events are emitted
    pub fn rollback(&mut self) -> Result<()> {
        if !self.active {
            return Err(QuereusError::misuse("no transaction is open"));
        }
        for key in &self.participants {
            if let Some(conn) = self.connections.get(key) {
                conn.rollback()?;
            }
        }
        debug!("transaction rolled back");
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.participants.clear();
        self.savepoints.clear();
        self.active = false;
        self.explicit = false;
    }

    /// Create a named savepoint; opens a transaction when none is open
    pub fn create_savepoint(&mut self, name: &str) -> Result<u32> {
        if !self.active {
            self.active = true;
            self.explicit = true;
        }
        let index = self.next_savepoint_index;
        self.next_savepoint_index += 1;
        for key in &self.participants {
            if let Some(conn) = self.connections.get(key) {
                conn.create_savepoint(index)?;
            }
        }
        self.savepoints.push(SavepointRecord {
            index,
            name: name.to_ascii_lowercase(),
        });
        Ok(index)
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        let wanted = name.to_ascii_lowercase();
        self.savepoints
            .iter()
            .rposition(|record| record.name == wanted)
            .ok_or_else(|| QuereusError::not_found(format!("no such savepoint: {name}")))
    }

    /// RELEASE: fold the savepoint (and everything above it) into its
    /// parent, keeping the changes
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.find_savepoint(name)?;
        let index = self.savepoints[position].index;
        for key in &self.participants {
            if let Some(conn) = self.connections.get(key) {
                conn.release_savepoint(index)?;
            }
        }
        self.savepoints.truncate(position);
        Ok(())
    }

    /// ROLLBACK TO: discard changes made since the savepoint; the
    /// savepoint itself remains open
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self.find_savepoint(name)?;
        let index = self.savepoints[position].index;
        for key in &self.participants {
            if let Some(conn) = self.connections.get(key) {
                conn.rollback_to_savepoint(index)?;
            }
        }
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    /// Close every pooled connection (database shutdown)
    pub fn disconnect_all(&mut self) -> Result<()> {
        for (_, conn) in self.connections.drain() {
            conn.disconnect()?;
        }
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DataChange;
    use crate::plan::MutationOp;
    use crate::value::Value;
    use parking_lot::Mutex;
    use std::any::Any;
    use std::sync::Arc;

    #[derive(Default)]
    struct CallLog {
        calls: Mutex<Vec<String>>,
        fail_commit: bool,
    }

    struct MockConnection {
        table: String,
        log: Arc<CallLog>,
    }

    impl MockConnection {
        fn push(&self, call: impl Into<String>) {
            self.log.calls.lock().push(format!("{}:{}", self.table, call.into()));
        }
    }

    impl VirtualTableConnection for MockConnection {
        fn connection_id(&self) -> uuid::Uuid {
            uuid::Uuid::nil()
        }

        fn table_name(&self) -> &str {
            &self.table
        }

        fn begin(&self) -> Result<()> {
            self.push("begin");
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            if self.log.fail_commit {
                return Err(QuereusError::constraint("flush failed"));
            }
            self.push("commit");
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            self.push("rollback");
            Ok(())
        }

        fn create_savepoint(&self, index: u32) -> Result<()> {
            self.push(format!("sp{index}"));
            Ok(())
        }

        fn release_savepoint(&self, index: u32) -> Result<()> {
            self.push(format!("release{index}"));
            Ok(())
        }

        fn rollback_to_savepoint(&self, index: u32) -> Result<()> {
            self.push(format!("rbto{index}"));
            Ok(())
        }

        fn take_pending_changes(&self) -> Vec<DataChange> {
            vec![DataChange {
                op: MutationOp::Insert,
                schema: "main".into(),
                table: self.table.clone(),
                old_row: None,
                new_row: Some(vec![Value::Integer(1)]),
                remote: false,
            }]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn coordinator() -> (TransactionCoordinator, Arc<DataChangeBus>) {
        let bus = Arc::new(DataChangeBus::new());
        (TransactionCoordinator::new(Arc::clone(&bus)), bus)
    }

    fn mock(table: &str, log: &Arc<CallLog>) -> Box<dyn VirtualTableConnection> {
        Box::new(MockConnection {
            table: table.into(),
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_nested_begin_is_rejected() {
        let (mut txn, _bus) = coordinator();
        txn.begin().expect("begin");
        assert!(txn.begin().is_err());
    }

    #[test]
    fn test_commit_broadcasts_changes() {
        let (mut txn, bus) = coordinator();
        let rx = bus.subscribe();
        let log = Arc::new(CallLog::default());
        txn.begin().expect("begin");
        txn.enlist("t", || Ok(mock("t", &log))).expect("enlist");
        txn.commit().expect("commit");
        assert!(rx.try_recv().is_ok());
        assert!(!txn.is_in_transaction());
    }

    #[test]
    fn test_rollback_emits_nothing() {
        let (mut txn, bus) = coordinator();
        let rx = bus.subscribe();
        let log = Arc::new(CallLog::default());
        txn.begin().expect("begin");
        txn.enlist("t", || Ok(mock("t", &log))).expect("enlist");
        txn.rollback().expect("rollback");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_commit_rolls_back_remaining() {
        let (mut txn, _bus) = coordinator();
        let bad = Arc::new(CallLog {
            fail_commit: true,
            ..CallLog::default()
        });
        let good = Arc::new(CallLog::default());
        txn.begin().expect("begin");
        txn.enlist("a", || Ok(mock("a", &bad))).expect("enlist");
        txn.enlist("b", || Ok(mock("b", &good))).expect("enlist");
        let err = txn.commit().expect_err("commit must fail");
        assert_eq!(err.code, crate::error::StatusCode::Constraint);
        assert!(good.calls.lock().iter().any(|c| c == "b:rollback"));
        assert!(!txn.is_in_transaction());
    }

    #[test]
    fn test_late_enlist_replays_savepoints() {
        let (mut txn, _bus) = coordinator();
        let log = Arc::new(CallLog::default());
        txn.begin().expect("begin");
        txn.create_savepoint("s1").expect("savepoint");
        txn.enlist("t", || Ok(mock("t", &log))).expect("enlist");
        let calls = log.calls.lock().clone();
        assert_eq!(calls, vec!["t:begin".to_string(), "t:sp0".to_string()]);
    }

    #[test]
    fn test_savepoint_release_and_rollback_to() {
        let (mut txn, _bus) = coordinator();
        let log = Arc::new(CallLog::default());
        txn.begin().expect("begin");
        txn.enlist("t", || Ok(mock("t", &log))).expect("enlist");
        txn.create_savepoint("a").expect("sp a");
        txn.create_savepoint("b").expect("sp b");
        txn.rollback_to_savepoint("a").expect("rollback to");
        // b is gone, a remains
        assert!(txn.rollback_to_savepoint("b").is_err());
        assert!(txn.release_savepoint("a").is_ok());
    }

    #[test]
    fn test_savepoint_opens_transaction() {
        let (mut txn, _bus) = coordinator();
        txn.create_savepoint("s").expect("savepoint");
        assert!(txn.is_in_transaction());
        assert!(txn.is_explicit());
    }

    #[test]
    fn test_unknown_savepoint() {
        let (mut txn, _bus) = coordinator();
        txn.begin().expect("begin");
        let err = txn.release_savepoint("nope").expect_err("must fail");
        assert_eq!(err.code, crate::error::StatusCode::NotFound);
    }
}

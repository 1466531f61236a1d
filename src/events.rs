//! # Change-Event Bus
//!
//! Process-scoped pub/sub for committed data changes. Virtual-table
//! connections buffer changes while a transaction is open; the
//! transaction coordinator collects and broadcasts them after a
//! successful commit. Rolled-back changes are never delivered.

use crate::plan::MutationOp;
use crate::value::Value;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;

/// A committed row change
#[derive(Debug, Clone, Serialize)]
pub struct DataChange {
    pub op: MutationOp,
    pub schema: String,
    pub table: String,
    pub old_row: Option<Vec<Value>>,
    pub new_row: Option<Vec<Value>>,
    /// Set on events relayed from another process, so listeners do not
    /// re-broadcast them
    pub remote: bool,
}

/// Fan-out of [`DataChange`] events to any number of subscribers
pub struct DataChangeBus {
    subscribers: RwLock<Vec<Sender<DataChange>>>,
}

impl DataChangeBus {
    pub fn new() -> Self {
        DataChangeBus {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> Receiver<DataChange> {
        let (tx, rx) = unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    /// Deliver a batch of committed changes in order
    pub fn broadcast(&self, changes: &[DataChange]) {
        if changes.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| {
            changes
                .iter()
                .all(|change| tx.send(change.clone()).is_ok())
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for DataChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

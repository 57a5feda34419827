//! Space: a named relation served by one storage engine.
//!
//! The transaction manager only needs a thin handle: the engine behind the
//! space, whether mutations are logged (temporary spaces are not), and the
//! `on_replace` trigger list run at commit-statement time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::StorageEngine;
use crate::txn::types::{Txn, TxnStmt};

/// Callback run after a statement produced an old or new tuple.
pub type ReplaceTrigger = Box<dyn Fn(&Txn, &TxnStmt) + Send + Sync>;

pub struct Space {
    id: u32,
    name: String,
    engine: Arc<dyn StorageEngine>,
    /// Mutations of a temporary space are not written to the log.
    temporary: bool,
    run_triggers: AtomicBool,
    on_replace: Mutex<Vec<ReplaceTrigger>>,
}

impl Space {
    pub fn new(id: u32, name: impl Into<String>, engine: Arc<dyn StorageEngine>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            engine,
            temporary: false,
            run_triggers: AtomicBool::new(true),
            on_replace: Mutex::new(Vec::new()),
        })
    }

    /// A space whose content does not survive a restart; its mutations skip
    /// the log entirely.
    pub fn temporary(id: u32, name: impl Into<String>, engine: Arc<dyn StorageEngine>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            engine,
            temporary: true,
            run_triggers: AtomicBool::new(true),
            on_replace: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> Arc<dyn StorageEngine> {
        Arc::clone(&self.engine)
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Registers an `on_replace` trigger.
    pub fn on_replace(&self, trigger: ReplaceTrigger) {
        self.on_replace.lock().push(trigger);
    }

    pub fn has_replace_triggers(&self) -> bool {
        !self.on_replace.lock().is_empty()
    }

    /// Disabling triggers is used during recovery replay.
    pub fn set_run_triggers(&self, run: bool) {
        self.run_triggers.store(run, Ordering::Relaxed);
    }

    pub fn run_triggers_enabled(&self) -> bool {
        self.run_triggers.load(Ordering::Relaxed)
    }

    /// Runs every `on_replace` trigger against the finished statement.
    /// Mutating tuples from a trigger is not supported.
    pub(crate) fn run_replace_triggers(&self, txn: &Txn, stmt: &TxnStmt) {
        let triggers = self.on_replace.lock();
        for trigger in triggers.iter() {
            trigger(txn, stmt);
        }
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("temporary", &self.temporary)
            .finish()
    }
}

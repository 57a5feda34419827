//! Core transaction types.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::common::{CoordinatorId, TransactionId};
use crate::engine::StorageEngine;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::space::Space;

/// Maximum nesting depth of sub-statements. Deep trigger recursion would
/// otherwise grow without bound.
pub const TXN_SUB_STMT_MAX: u32 = 3;

/// Arena tied to a transaction's lifetime. Freed wholesale at the terminal.
#[derive(Debug, Default)]
pub struct Region {
    chunks: Vec<Box<[u8]>>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zeroed chunk that lives until the transaction ends.
    pub fn alloc(&mut self, size: usize) -> &mut [u8] {
        self.chunks.push(vec![0u8; size].into_boxed_slice());
        self.chunks.last_mut().expect("chunk was just pushed")
    }

    pub fn allocated(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.len()).sum()
    }
}

/// Trigger run exactly once at the transaction terminal. Must not fail.
pub type TxnTrigger = Box<dyn FnOnce(&Txn) + Send>;

/// A single mutation within a transaction.
pub struct TxnStmt {
    pub space: Arc<Space>,
    /// Tuple snapshot before the statement, if one existed.
    pub old_tuple: Option<Bytes>,
    /// Tuple after the statement, if one remains.
    pub new_tuple: Option<Bytes>,
    /// Engine-owned savepoint handle, set at `begin_statement`.
    pub engine_savepoint: Option<Box<dyn Any + Send>>,
    /// The redo row; None means the statement is read-only and is not
    /// logged. At commit-statement time a logged statement has exactly one.
    pub row: Option<Row>,
}

impl TxnStmt {
    pub fn new(space: Arc<Space>) -> Self {
        Self {
            space,
            old_tuple: None,
            new_tuple: None,
            engine_savepoint: None,
            row: None,
        }
    }
}

/// Per-task transaction state.
///
/// The statement list only grows until the commit/rollback terminal. The
/// engine is bound on the first non-trivial statement and never changes. A
/// two-phase transaction moves `open -> prepared -> committed | rolled
/// back`; an auto-commit transaction commits implicitly when the
/// sub-statement depth returns to zero.
pub struct Txn {
    pub(crate) stmts: Vec<TxnStmt>,
    pub is_two_phase: bool,
    /// Set once the PREPARE record is durable.
    pub in_prepare: bool,
    pub is_autocommit: bool,
    pub(crate) in_sub_stmt: u32,
    /// Number of statements with a redo row.
    pub(crate) n_rows: usize,
    pub tx_id: TransactionId,
    pub coordinator_id: CoordinatorId,
    pub(crate) engine: Option<Arc<dyn StorageEngine>>,
    /// Engine-specific transaction object, owned by the engine.
    pub engine_tx: Option<Box<dyn Any + Send>>,
    pub(crate) region: Region,
    pub(crate) on_commit: Vec<TxnTrigger>,
    pub(crate) on_rollback: Vec<TxnTrigger>,
}

impl Txn {
    pub fn new(is_autocommit: bool) -> Self {
        Self {
            stmts: Vec::new(),
            is_two_phase: false,
            in_prepare: false,
            is_autocommit,
            in_sub_stmt: 0,
            n_rows: 0,
            tx_id: 0,
            coordinator_id: 0,
            engine: None,
            engine_tx: None,
            region: Region::new(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    pub fn new_two_phase(tx_id: TransactionId, coordinator_id: CoordinatorId) -> Self {
        let mut txn = Self::new(false);
        txn.tx_id = tx_id;
        txn.coordinator_id = coordinator_id;
        txn.is_two_phase = true;
        txn
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn in_sub_stmt(&self) -> u32 {
        self.in_sub_stmt
    }

    pub fn stmts(&self) -> &[TxnStmt] {
        &self.stmts
    }

    pub fn last_stmt(&self) -> Option<&TxnStmt> {
        self.stmts.last()
    }

    pub fn last_stmt_mut(&mut self) -> Option<&mut TxnStmt> {
        self.stmts.last_mut()
    }

    pub fn engine(&self) -> Option<Arc<dyn StorageEngine>> {
        self.engine.clone()
    }

    /// Runs `trigger` when the transaction commits.
    pub fn on_commit(&mut self, trigger: TxnTrigger) {
        self.on_commit.push(trigger);
    }

    /// Runs `trigger` when the transaction rolls back.
    pub fn on_rollback(&mut self, trigger: TxnTrigger) {
        self.on_rollback.push(trigger);
    }

    /// Binds the engine serving the first statement. A different engine on
    /// a later statement is a `cross_engine_transaction` error.
    pub(crate) fn bind_engine(&mut self, engine: &Arc<dyn StorageEngine>) -> Result<()> {
        if let Some(current) = &self.engine {
            if Arc::ptr_eq(current, engine) {
                return Ok(());
            }
            return Err(Error::CrossEngineTransaction);
        }
        debug_assert!(self.stmts.is_empty());
        if !engine.supports_multi_statement() && !self.is_autocommit {
            return Err(Error::Unsupported(
                engine.name().to_string(),
                "multi-statement transactions".to_string(),
            ));
        }
        self.engine = Some(Arc::clone(engine));
        engine.begin(self)
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("stmts", &self.stmts.len())
            .field("is_two_phase", &self.is_two_phase)
            .field("in_prepare", &self.in_prepare)
            .field("is_autocommit", &self.is_autocommit)
            .field("in_sub_stmt", &self.in_sub_stmt)
            .field("n_rows", &self.n_rows)
            .field("tx_id", &self.tx_id)
            .finish()
    }
}

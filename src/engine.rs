//! Storage engine seam.
//!
//! The transaction manager drives engines exclusively through
//! [`StorageEngine`]; only one engine may participate in a multi-statement
//! transaction. [`MemoryEngine`] is the reference implementation: an
//! in-memory tuple store with an undo log, enough to run the crate's tests
//! and to serve the two-phase bookkeeping table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::request::{decode_ops, DmlRequest};
use crate::row::OpKind;
use crate::txn::types::Txn;

/// Operations the transaction manager invokes on a storage engine.
///
/// `txn` gives the engine access to its per-transaction state
/// (`txn.engine_tx`) and to the statement list; the engine owns both
/// conventions.
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Engines that cannot run multi-statement transactions reject them at
    /// bind time.
    fn supports_multi_statement(&self) -> bool {
        true
    }

    /// Called once when the engine is bound to a transaction.
    fn begin(&self, txn: &mut Txn) -> Result<()>;

    /// Called after a new statement was opened; the engine records a
    /// savepoint on it.
    fn begin_statement(&self, txn: &mut Txn) -> Result<()>;

    /// Applies a DML request: mutates engine state, records undo, and fills
    /// the open statement's old/new tuples.
    fn execute(&self, txn: &mut Txn, request: &DmlRequest) -> Result<()>;

    /// Voids the effects of the last statement (back to its savepoint).
    fn rollback_statement(&self, txn: &mut Txn);

    /// Transaction conflict resolution before a one-phase commit.
    fn prepare(&self, txn: &mut Txn) -> Result<()>;

    /// Two-phase commit: called before the PREPARE frame is written.
    fn begin_prepare_two_phase(&self, txn: &mut Txn) -> Result<()>;

    /// Two-phase commit: called after the PREPARE frame is durable;
    /// `signature` is the log signature of the prepare, or -1 when nothing
    /// was written.
    fn end_prepare_two_phase(&self, txn: &mut Txn, signature: i64) -> Result<()>;

    /// Finalizes the transaction. The commit record is already durable, so
    /// this must not fail.
    fn commit(&self, txn: &mut Txn, signature: i64);

    /// Undoes every statement of the transaction.
    fn rollback(&self, txn: &mut Txn);
}

// =============================================================================
// Tuple helpers
// =============================================================================

/// Tuples are an ordered list of opaque fields.
pub fn encode_tuple(fields: &[Bytes]) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(fields)?))
}

pub fn decode_tuple(tuple: &[u8]) -> Result<Vec<Bytes>> {
    Ok(bincode::deserialize(tuple)?)
}

// =============================================================================
// Reference engine
// =============================================================================

/// Per-transaction engine state: the undo log.
#[derive(Debug, Default)]
struct MemTx {
    undo: Vec<UndoEntry>,
}

#[derive(Debug)]
struct UndoEntry {
    space_id: u32,
    key: Bytes,
    prior: Option<Bytes>,
}

/// In-memory tuple store keyed by primary key, with statement-level
/// savepoints implemented over an undo log.
#[derive(Default)]
pub struct MemoryEngine {
    spaces: RwLock<HashMap<u32, BTreeMap<Bytes, Bytes>>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reads a committed (or speculatively applied) tuple.
    pub fn get(&self, space_id: u32, key: &[u8]) -> Option<Bytes> {
        self.spaces.read().get(&space_id)?.get(key).cloned()
    }

    pub fn len(&self, space_id: u32) -> usize {
        self.spaces
            .read()
            .get(&space_id)
            .map_or(0, |space| space.len())
    }

    pub fn is_empty(&self, space_id: u32) -> bool {
        self.len(space_id) == 0
    }

    fn memtx<'a>(&self, txn: &'a mut Txn) -> Result<&'a mut MemTx> {
        txn.engine_tx
            .as_mut()
            .and_then(|any| any.downcast_mut::<MemTx>())
            .ok_or_else(|| Error::Storage("transaction is not bound to the memory engine".into()))
    }

    fn restore(&self, entry: UndoEntry) {
        let mut spaces = self.spaces.write();
        let space = spaces.entry(entry.space_id).or_default();
        match entry.prior {
            Some(tuple) => {
                space.insert(entry.key, tuple);
            }
            None => {
                space.remove(&entry.key);
            }
        }
    }

    fn apply_ops(&self, old: &Bytes, encoded_ops: &Bytes) -> Result<Bytes> {
        let mut fields = decode_tuple(old)?;
        let ops = decode_ops(encoded_ops)?;
        for op in ops {
            let index = if op.field_no < 0 {
                let from_end = op
                    .field_no
                    .checked_neg()
                    .ok_or_else(|| Error::Storage("bad field number".into()))?
                    as usize;
                fields
                    .len()
                    .checked_sub(from_end)
                    .ok_or_else(|| Error::Storage("field number out of range".into()))?
            } else {
                op.field_no as usize
            };
            match op.op {
                b'=' => {
                    let field = fields
                        .get_mut(index)
                        .ok_or_else(|| Error::Storage("field number out of range".into()))?;
                    *field = op.arg;
                }
                other => {
                    return Err(Error::Unsupported(
                        self.name().to_string(),
                        format!("update operation {:?}", other as char),
                    ))
                }
            }
        }
        encode_tuple(&fields)
    }
}

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(&self, txn: &mut Txn) -> Result<()> {
        txn.engine_tx = Some(Box::new(MemTx::default()));
        Ok(())
    }

    fn begin_statement(&self, txn: &mut Txn) -> Result<()> {
        let savepoint = self.memtx(txn)?.undo.len();
        let stmt = txn
            .stmts
            .last_mut()
            .ok_or_else(|| Error::Storage("no open statement".into()))?;
        stmt.engine_savepoint = Some(Box::new(savepoint));
        Ok(())
    }

    fn execute(&self, txn: &mut Txn, request: &DmlRequest) -> Result<()> {
        let key = request
            .key
            .clone()
            .ok_or_else(|| Error::Storage("request is missing a key".into()))?;
        let space_id = request.space_id;

        let (prior, new) = {
            let mut spaces = self.spaces.write();
            let space = spaces.entry(space_id).or_default();
            let prior = space.get(&key).cloned();
            let new = match request.op {
                OpKind::Insert => {
                    if prior.is_some() {
                        return Err(Error::Storage(format!(
                            "duplicate key in space {space_id}"
                        )));
                    }
                    Some(required_tuple(request)?)
                }
                OpKind::Replace => Some(required_tuple(request)?),
                OpKind::Update => {
                    let old = prior.clone().ok_or_else(|| {
                        Error::Storage(format!("no tuple to update in space {space_id}"))
                    })?;
                    let ops = request
                        .ops
                        .as_ref()
                        .ok_or_else(|| Error::Storage("update without operations".into()))?;
                    Some(self.apply_ops(&old, ops)?)
                }
                OpKind::Upsert => match prior.clone() {
                    None => Some(required_tuple(request)?),
                    Some(old) => {
                        let ops = request
                            .ops
                            .as_ref()
                            .ok_or_else(|| Error::Storage("upsert without operations".into()))?;
                        Some(self.apply_ops(&old, ops)?)
                    }
                },
                OpKind::Delete => None,
                _ => {
                    return Err(Error::Storage(
                        "marker operations are not executable".into(),
                    ))
                }
            };
            match &new {
                Some(tuple) => {
                    space.insert(key.clone(), tuple.clone());
                }
                None => {
                    space.remove(&key);
                }
            }
            (prior, new)
        };

        self.memtx(txn)?.undo.push(UndoEntry {
            space_id,
            key,
            prior: prior.clone(),
        });
        let stmt = txn
            .stmts
            .last_mut()
            .ok_or_else(|| Error::Storage("no open statement".into()))?;
        stmt.old_tuple = prior;
        stmt.new_tuple = new;
        Ok(())
    }

    fn rollback_statement(&self, txn: &mut Txn) {
        let savepoint = txn
            .stmts
            .last()
            .and_then(|stmt| stmt.engine_savepoint.as_ref())
            .and_then(|any| any.downcast_ref::<usize>())
            .copied()
            .unwrap_or(0);
        let undone = match self.memtx(txn) {
            Ok(memtx) => memtx.undo.split_off(savepoint),
            Err(_) => return,
        };
        for entry in undone.into_iter().rev() {
            self.restore(entry);
        }
    }

    fn prepare(&self, _txn: &mut Txn) -> Result<()> {
        Ok(())
    }

    fn begin_prepare_two_phase(&self, _txn: &mut Txn) -> Result<()> {
        Ok(())
    }

    fn end_prepare_two_phase(&self, _txn: &mut Txn, _signature: i64) -> Result<()> {
        Ok(())
    }

    fn commit(&self, txn: &mut Txn, _signature: i64) {
        // The speculative state is already in place; forget the undo log.
        txn.engine_tx = None;
    }

    fn rollback(&self, txn: &mut Txn) {
        let Some(any) = txn.engine_tx.take() else {
            return;
        };
        let Ok(memtx) = any.downcast::<MemTx>() else {
            return;
        };
        for entry in memtx.undo.into_iter().rev() {
            self.restore(entry);
        }
    }
}

fn required_tuple(request: &DmlRequest) -> Result<Bytes> {
    request
        .tuple
        .clone()
        .ok_or_else(|| Error::Storage("request is missing a tuple".into()))
}

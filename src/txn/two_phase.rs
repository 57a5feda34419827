//! Bookkeeping-table writes of the two-phase commit protocol.
//!
//! The system transaction-log space records, keyed by transaction id:
//! an insert of `(tx_id, coordinator_id, "prepare")` when the transaction
//! prepares, an update of the state field to `"commit"` or `"rollback"` at
//! the end, and a delete once the end marker is durable. Each write is an
//! ordinary auto-commit mutation issued on a fresh transaction slot (the
//! "sub-task"), since the owning task is still inside its own transaction.

use std::sync::Arc;

use bytes::Bytes;

use crate::common::{CoordinatorId, TransactionId};
use crate::engine::encode_tuple;
use crate::error::Result;
use crate::request::{DmlRequest, UpdateOp};
use crate::row::OpKind;
use crate::space::Space;
use crate::txn::types::Txn;
use crate::txn::TxnContext;

/// Index (1-based) of the state field inside a bookkeeping tuple.
const STATE_FIELD: i64 = 3;

fn key(tx_id: TransactionId) -> Bytes {
    Bytes::copy_from_slice(&tx_id.to_le_bytes())
}

/// Records durable intent: insert `(tx_id, coordinator_id, "prepare")`.
pub(crate) async fn log_prepare(
    ctx: &TxnContext,
    tx_id: TransactionId,
    coordinator_id: CoordinatorId,
) -> Result<()> {
    let space = ctx.txn_log_space()?;
    let tuple = encode_tuple(&[
        key(tx_id),
        Bytes::copy_from_slice(&coordinator_id.to_le_bytes()),
        Bytes::from_static(b"prepare"),
    ])?;
    let mut request = DmlRequest::insert(space.id(), key(tx_id), tuple);
    run_system_dml(ctx, &space, &mut request).await
}

/// Records the durable outcome: update the state field to `"commit"` or
/// `"rollback"`.
pub(crate) async fn log_end(ctx: &TxnContext, tx_id: TransactionId, end: OpKind) -> Result<()> {
    debug_assert!(matches!(end, OpKind::Commit | OpKind::Rollback));
    let state: &'static [u8] = match end {
        OpKind::Commit => b"commit",
        _ => b"rollback",
    };
    let space = ctx.txn_log_space()?;
    let ops = [UpdateOp {
        op: b'=',
        field_no: STATE_FIELD,
        splice_pos: None,
        arg: Bytes::from_static(state),
    }];
    let mut request = DmlRequest::update(space.id(), key(tx_id), &ops, 1)?;
    Box::pin(run_system_dml(ctx, &space, &mut request)).await
}

/// Scrubs the bookkeeping row once the outcome is durable.
pub(crate) async fn log_delete(ctx: &TxnContext, tx_id: TransactionId) -> Result<()> {
    let space = ctx.txn_log_space()?;
    let mut request = DmlRequest::delete(space.id(), key(tx_id));
    Box::pin(run_system_dml(ctx, &space, &mut request)).await
}

/// One auto-commit statement on a fresh transaction slot.
async fn run_system_dml(
    ctx: &TxnContext,
    space: &Arc<Space>,
    request: &mut DmlRequest,
) -> Result<()> {
    request.ensure_normalized()?;
    let mut slot: Option<Box<Txn>> = None;
    ctx.begin_stmt(&mut slot, space)?;
    let engine = space.engine();
    if let Err(err) = engine.execute(slot.as_mut().expect("statement just opened"), request) {
        ctx.rollback_stmt(&mut slot).await;
        return Err(err);
    }
    ctx.commit_stmt(&mut slot, request).await
}

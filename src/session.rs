//! Per-task boundary API.
//!
//! A [`Session`] stands in for the task ("fiber") executing requests: it
//! carries the task's transaction slot and exposes the operations request
//! handlers call. Every operation returns a typed [`Result`]; failures
//! never propagate out-of-band. The transaction pointer is a back-reference
//! in the usage sense only: installed by `begin`, cleared at the terminal,
//! with the session owning the transaction value itself.

use std::sync::Arc;

use crate::common::{CoordinatorId, Signature, TransactionId};
use crate::error::{Error, Result};
use crate::request::DmlRequest;
use crate::space::Space;
use crate::txn::types::Txn;
use crate::txn::TxnContext;

pub struct Session {
    ctx: Arc<TxnContext>,
    txn: Option<Box<Txn>>,
}

impl Session {
    pub fn new(ctx: Arc<TxnContext>) -> Self {
        Self { ctx, txn: None }
    }

    pub fn context(&self) -> &Arc<TxnContext> {
        &self.ctx
    }

    pub fn is_in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn txn(&self) -> Option<&Txn> {
        self.txn.as_deref()
    }

    pub fn txn_mut(&mut self) -> Option<&mut Txn> {
        self.txn.as_deref_mut()
    }

    /// Starts an explicit (non-auto-commit) transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::ActiveTransaction);
        }
        self.txn = Some(self.ctx.begin(false));
        Ok(())
    }

    /// Starts a two-phase transaction; `tx_id` and `coordinator_id` are
    /// carried on every row it logs.
    pub fn begin_two_phase(
        &mut self,
        tx_id: TransactionId,
        coordinator_id: CoordinatorId,
    ) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::ActiveTransaction);
        }
        self.txn = Some(self.ctx.begin_two_phase(tx_id, coordinator_id));
        Ok(())
    }

    /// Makes the transaction's intent durable. Precondition failures (no
    /// transaction, not two-phase, already prepared) leave the transaction
    /// untouched; a failure past them means durable state may exist, so the
    /// transaction is rolled back before the error is returned.
    pub async fn prepare_two_phase(&mut self) -> Result<()> {
        let Some(txn) = self.txn.as_ref() else {
            return Err(Error::NoActiveTransaction);
        };
        if txn.in_prepare {
            return Err(Error::AlreadyPrepared(txn.tx_id));
        }
        if !txn.is_two_phase {
            return Err(Error::Unsupported(
                "transaction".to_string(),
                "prepare of a one-phase transaction".to_string(),
            ));
        }
        let mut txn = self.txn.take().expect("checked above");
        match self.ctx.prepare_two_phase(&mut txn, None).await {
            Ok(()) => {
                self.txn = Some(txn);
                Ok(())
            }
            Err(err) => {
                self.ctx.rollback(txn).await;
                Err(err)
            }
        }
    }

    /// Commits the transaction and returns the log signature it is covered
    /// by. Like `begin`, COMMIT without a transaction is a no-op (the same
    /// as BEGIN immediately followed by COMMIT).
    pub async fn commit(&mut self) -> Result<Signature> {
        let Some(txn) = self.txn.take() else {
            return Ok(self.ctx.assigner().sum());
        };
        if txn.in_sub_stmt() > 0 {
            self.txn = Some(txn);
            return Err(Error::CommitInSubStmt);
        }
        if txn.is_two_phase && !txn.in_prepare {
            self.txn = Some(txn);
            return Err(Error::CommitBeforePrepare);
        }
        self.ctx.commit(txn).await
    }

    /// Rolls the transaction back. Idempotent: a task without a transaction
    /// has nothing to undo.
    pub async fn rollback(&mut self) -> Result<()> {
        if let Some(txn) = &self.txn {
            if txn.in_sub_stmt() > 0 {
                return Err(Error::RollbackInSubStmt);
            }
        }
        if let Some(txn) = self.txn.take() {
            self.ctx.rollback(txn).await;
        }
        Ok(())
    }

    /// Opens a statement against `space`, creating an auto-commit
    /// transaction if none is active.
    pub fn begin_statement(&mut self, space: &Arc<Space>) -> Result<()> {
        self.ctx.begin_stmt(&mut self.txn, space)
    }

    /// Ends the last-opened statement. In auto-commit mode this commits the
    /// transaction once the statement depth returns to zero.
    pub async fn commit_statement(&mut self, request: &mut DmlRequest) -> Result<()> {
        self.ctx.commit_stmt(&mut self.txn, request).await
    }

    /// Voids the last-opened statement.
    pub async fn rollback_statement(&mut self) {
        self.ctx.rollback_stmt(&mut self.txn).await
    }

    /// Runs one DML request end to end: statement open, engine execution,
    /// statement commit. The usual path of a request handler.
    pub async fn apply(&mut self, space: &Arc<Space>, request: &mut DmlRequest) -> Result<()> {
        request.ensure_normalized()?;
        self.begin_statement(space)?;
        let engine = space.engine();
        if let Err(err) = engine.execute(self.txn.as_mut().expect("statement just opened"), request)
        {
            self.rollback_statement().await;
            return Err(err);
        }
        self.commit_statement(request).await
    }

    /// Allocates scratch memory on the active transaction's arena; freed
    /// with the transaction.
    pub fn alloc(&mut self, size: usize) -> Result<&mut [u8]> {
        let txn = self.txn.as_deref_mut().ok_or(Error::NoActiveTransaction)?;
        Ok(txn.region.alloc(size))
    }
}
